use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use jobsift_core::{SourceTag, VacancyRecord};
use jobsift_sources::{
    translate_options, RecordNormalizer, SourceClient, SourceFetchError, SourceOptions,
};
use serde::Serialize;
use tokio::task::{Id as TaskId, JoinError, JoinSet};
use tracing::{info, info_span, warn, Instrument};

/// What one source contributed to an aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: SourceTag,
    pub fetched: usize,
    pub normalized: usize,
    pub dropped: usize,
    pub error: Option<String>,
}

impl SourceReport {
    fn failed(source: SourceTag, err: &SourceFetchError) -> Self {
        Self {
            source,
            fetched: 0,
            normalized: 0,
            dropped: 0,
            error: Some(err.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Records of every successful source, concatenated in source priority order.
    pub records: Vec<VacancyRecord>,
    pub reports: Vec<SourceReport>,
}

/// Parses requested source names, dropping unknown ones.
///
/// Falls back to every known source when nothing valid remains. The result
/// is in priority order with no repeats.
pub fn resolve_sources<S: AsRef<str>>(requested: &[S]) -> Vec<SourceTag> {
    let mut picked = BTreeSet::new();
    for name in requested {
        match SourceTag::parse(name.as_ref()) {
            Some(source) => {
                picked.insert(source);
            }
            None => warn!(source = name.as_ref(), "ignoring unknown source"),
        }
    }
    if picked.is_empty() {
        return SourceTag::all().to_vec();
    }
    picked.into_iter().collect()
}

/// Fans a query out to every selected source and merges the normalized results.
///
/// Each source runs in its own task. A failing, panicking or late source
/// contributes nothing and never affects the others.
pub struct Aggregator {
    clients: BTreeMap<SourceTag, Arc<dyn SourceClient>>,
    normalizer: Arc<dyn RecordNormalizer>,
    deadline: Duration,
}

impl Aggregator {
    pub fn new(
        clients: Vec<Arc<dyn SourceClient>>,
        normalizer: Arc<dyn RecordNormalizer>,
        deadline: Duration,
    ) -> Self {
        let clients = clients.into_iter().map(|c| (c.source(), c)).collect();
        Self {
            clients,
            normalizer,
            deadline,
        }
    }

    pub async fn aggregate(
        &self,
        query: &str,
        sources: &[SourceTag],
        options: &SourceOptions,
    ) -> Aggregation {
        let mut tasks = JoinSet::new();
        let mut pending: BTreeSet<SourceTag> = BTreeSet::new();
        let mut task_sources: HashMap<TaskId, SourceTag> = HashMap::new();
        let mut outcomes: BTreeMap<SourceTag, (Vec<VacancyRecord>, SourceReport)> = BTreeMap::new();

        for &source in sources {
            let Some(client) = self.clients.get(&source).cloned() else {
                let err = SourceFetchError::Task(format!("no client configured for {source}"));
                warn!(source = %source, "no client configured");
                outcomes.insert(source, (Vec::new(), SourceReport::failed(source, &err)));
                continue;
            };
            if !pending.insert(source) {
                continue;
            }
            let normalizer = self.normalizer.clone();
            let query = query.to_string();
            let native = translate_options(source, options);
            let span = info_span!("source_fetch", source = %source);
            let handle = tasks.spawn(
                async move {
                    let result = client.fetch(&query, &native).await;
                    (source, result.map(|raw| normalize_all(normalizer.as_ref(), source, &raw)))
                }
                .instrument(span),
            );
            task_sources.insert(handle.id(), source);
        }

        let deadline = tokio::time::Instant::now() + self.deadline;
        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next_with_id()).await {
                Ok(Some(Ok((_, (source, result))))) => {
                    pending.remove(&source);
                    let entry = match result {
                        Ok((records, report)) => (records, report),
                        Err(err) => {
                            warn!(source = %source, error = %err, "source fetch failed");
                            (Vec::new(), SourceReport::failed(source, &err))
                        }
                    };
                    outcomes.insert(source, entry);
                }
                Ok(Some(Err(join_err))) => {
                    let Some(source) = task_sources.get(&join_err.id()).copied() else {
                        warn!(error = %join_err, "unknown source task failed");
                        continue;
                    };
                    pending.remove(&source);
                    let detail = task_failure(join_err);
                    warn!(source = %source, error = %detail, "source task failed");
                    let err = SourceFetchError::Task(detail);
                    outcomes.insert(source, (Vec::new(), SourceReport::failed(source, &err)));
                }
                Ok(None) => break,
                Err(_) => {
                    tasks.abort_all();
                    for source in std::mem::take(&mut pending) {
                        warn!(source = %source, deadline = ?self.deadline, "source fetch timed out");
                        let err = SourceFetchError::TimedOut;
                        outcomes.insert(source, (Vec::new(), SourceReport::failed(source, &err)));
                    }
                    break;
                }
            }
        }

        let mut aggregation = Aggregation::default();
        for (_, (records, report)) in outcomes {
            aggregation.records.extend(records);
            aggregation.reports.push(report);
        }
        info!(
            query,
            sources = sources.len(),
            records = aggregation.records.len(),
            "aggregation finished"
        );
        aggregation
    }
}

/// The panic message of a failed task, or the join error itself.
fn task_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}

fn normalize_all(
    normalizer: &dyn RecordNormalizer,
    source: SourceTag,
    raw: &[jobsift_sources::RawRecord],
) -> (Vec<VacancyRecord>, SourceReport) {
    let mut records = Vec::with_capacity(raw.len());
    let mut dropped = 0;
    for item in raw {
        match normalizer.normalize(item, source) {
            Ok(record) => records.push(record),
            Err(err) => {
                dropped += 1;
                warn!(source = %source, error = %err, "dropping malformed record");
            }
        }
    }
    let report = SourceReport {
        source,
        fetched: raw.len(),
        normalized: records.len(),
        dropped,
        error: None,
    };
    (records, report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{hh_raw, sj_raw, MockClient};
    use jobsift_sources::JsonRecordNormalizer;
    use serde_json::json;

    fn aggregator(clients: Vec<Arc<MockClient>>, deadline: Duration) -> Aggregator {
        let clients = clients
            .into_iter()
            .map(|c| c as Arc<dyn SourceClient>)
            .collect();
        Aggregator::new(clients, Arc::new(JsonRecordNormalizer), deadline)
    }

    #[test]
    fn unknown_sources_are_dropped_and_order_is_priority() {
        assert_eq!(
            resolve_sources(&["superjob", "linkedin", "hh", "sj"]),
            vec![SourceTag::HeadHunter, SourceTag::SuperJob]
        );
        assert_eq!(resolve_sources(&["sj"]), vec![SourceTag::SuperJob]);
    }

    #[test]
    fn no_valid_source_means_all_sources() {
        let none: [&str; 0] = [];
        assert_eq!(resolve_sources(&none), SourceTag::all().to_vec());
        assert_eq!(resolve_sources(&["nope"]), SourceTag::all().to_vec());
    }

    #[tokio::test]
    async fn failing_source_does_not_affect_the_other() {
        let hh = MockClient::failing(SourceTag::HeadHunter);
        let sj = MockClient::returning(SourceTag::SuperJob, vec![sj_raw(9, "py dev", "ACME")]);
        let agg = aggregator(vec![hh, sj], Duration::from_secs(5));

        let out = agg
            .aggregate("python", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].source, SourceTag::SuperJob);
        assert_eq!(out.records[0].title, "py dev");
        assert!(!out.reports[0].succeeded());
        assert!(out.reports[1].succeeded());
    }

    #[tokio::test]
    async fn results_merge_in_priority_order() {
        let sj = MockClient::returning(SourceTag::SuperJob, vec![sj_raw(9, "B", "Y")]);
        let hh = MockClient::delayed(
            SourceTag::HeadHunter,
            vec![hh_raw("1", "A", "X")],
            Duration::from_millis(50),
        );
        let agg = aggregator(vec![sj, hh], Duration::from_secs(5));
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        let sources: Vec<_> = out.records.iter().map(|r| r.source).collect();
        assert_eq!(sources, vec![SourceTag::HeadHunter, SourceTag::SuperJob]);
    }

    #[tokio::test]
    async fn period_is_forwarded_under_native_names() {
        let hh = MockClient::returning(SourceTag::HeadHunter, vec![]);
        let sj = MockClient::returning(SourceTag::SuperJob, vec![]);
        let agg = aggregator(vec![hh.clone(), sj.clone()], Duration::from_secs(5));

        let mut options = SourceOptions::new();
        options.insert("period".into(), json!(7));
        agg.aggregate("q", &SourceTag::all(), &options).await;

        let sj_seen = sj.seen_options();
        assert_eq!(sj_seen[0].get("published"), Some(&json!(7)));
        assert!(!sj_seen[0].contains_key("period"));
        assert_eq!(hh.seen_options()[0].get("period"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn malformed_record_is_dropped_alone() {
        let hh = MockClient::returning(
            SourceTag::HeadHunter,
            vec![hh_raw("1", "A", "X"), json!({"name": "no id"}), hh_raw("2", "B", "X")],
        );
        let agg = aggregator(vec![hh], Duration::from_secs(5));
        let out = agg
            .aggregate("q", &[SourceTag::HeadHunter], &SourceOptions::new())
            .await;
        assert_eq!(out.records.len(), 2);
        assert_eq!(out.reports[0].fetched, 3);
        assert_eq!(out.reports[0].dropped, 1);
    }

    #[tokio::test]
    async fn late_source_is_abandoned_at_the_deadline() {
        let hh = MockClient::delayed(
            SourceTag::HeadHunter,
            vec![hh_raw("1", "A", "X")],
            Duration::from_secs(30),
        );
        let sj = MockClient::returning(SourceTag::SuperJob, vec![sj_raw(2, "B", "Y")]);
        let agg = aggregator(vec![hh, sj], Duration::from_millis(200));

        let started = std::time::Instant::now();
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].source, SourceTag::SuperJob);
        let hh_report = &out.reports[0];
        assert_eq!(hh_report.source, SourceTag::HeadHunter);
        assert_eq!(
            hh_report.error.as_deref(),
            Some(SourceFetchError::TimedOut.to_string().as_str())
        );
    }

    #[tokio::test]
    async fn panicking_source_is_isolated() {
        let hh = MockClient::panicking(SourceTag::HeadHunter);
        let sj = MockClient::returning(SourceTag::SuperJob, vec![sj_raw(2, "B", "Y")]);
        let agg = aggregator(vec![hh, sj], Duration::from_secs(5));
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert_eq!(out.records.len(), 1);
        assert!(out.reports[0].error.is_some());
    }

    #[tokio::test]
    async fn each_panicking_source_reports_its_own_panic() {
        let agg = aggregator(
            vec![
                MockClient::panicking(SourceTag::HeadHunter),
                MockClient::panicking(SourceTag::SuperJob),
            ],
            Duration::from_secs(5),
        );
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert!(out.records.is_empty());
        assert_eq!(out.reports.len(), 2);
        for report in &out.reports {
            let error = report.error.as_deref().unwrap_or_default();
            assert!(
                error.contains(&format!("client bug in {}", report.source)),
                "{}: {error}",
                report.source
            );
        }
        assert_ne!(out.reports[0].error, out.reports[1].error);
    }

    #[tokio::test]
    async fn every_source_failing_is_an_empty_result() {
        let agg = aggregator(
            vec![
                MockClient::failing(SourceTag::HeadHunter),
                MockClient::failing(SourceTag::SuperJob),
            ],
            Duration::from_secs(5),
        );
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert!(out.records.is_empty());
        assert_eq!(out.reports.len(), 2);
    }

    #[tokio::test]
    async fn source_without_client_is_reported() {
        let agg = aggregator(
            vec![MockClient::returning(SourceTag::HeadHunter, vec![])],
            Duration::from_secs(5),
        );
        let out = agg
            .aggregate("q", &SourceTag::all(), &SourceOptions::new())
            .await;
        assert!(out.reports[0].succeeded());
        assert!(!out.reports[1].succeeded());
    }
}
