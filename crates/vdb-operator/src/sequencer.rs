//! Ordered execution of reconcile steps for one pass
//!
//! A pass owns the working copy of the VerticaDB and the pod fact snapshot.
//! Steps run in a fixed order against the same pass; the first error or
//! requeue request ends the pass.

use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use vdb_common::crd::VerticaDB;
use vdb_common::Result;

use crate::podfacts::PodFacts;

/// What a step wants the driver to do next
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing left for this step
    #[default]
    Done,
    /// Run the pass again shortly
    RequeueNow,
    /// Run the pass again after a delay
    RequeueAfter(Duration),
}

impl ReconcileOutcome {
    /// Whether the pass must stop here
    pub fn is_abort(self) -> bool {
        !matches!(self, Self::Done)
    }

    /// Combine two outcomes, keeping the more urgent requeue
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::RequeueNow, _) | (_, Self::RequeueNow) => Self::RequeueNow,
            (Self::RequeueAfter(a), Self::RequeueAfter(b)) => Self::RequeueAfter(a.min(b)),
            (Self::RequeueAfter(d), Self::Done) | (Self::Done, Self::RequeueAfter(d)) => {
                Self::RequeueAfter(d)
            }
            (Self::Done, Self::Done) => Self::Done,
        }
    }

    /// `RequeueNow` when `more_work` is set, otherwise `Done`
    pub fn requeue_if(more_work: bool) -> Self {
        if more_work {
            Self::RequeueNow
        } else {
            Self::Done
        }
    }
}

/// State shared by every step of one pass
#[derive(Debug)]
pub struct Pass {
    /// Working copy, refreshed after every status or spec write
    pub vdb: VerticaDB,
    /// Pod facts for the pass scope
    pub facts: PodFacts,
}

impl Pass {
    /// Start a pass
    pub fn new(vdb: VerticaDB, facts: PodFacts) -> Self {
        Self { vdb, facts }
    }

    /// Collect facts if stale
    pub async fn collect(&mut self) -> Result<()> {
        self.facts.collect(&self.vdb).await
    }

    /// Mark facts stale after a topology change
    pub fn invalidate(&mut self) {
        self.facts.invalidate();
    }
}

/// One concern of the reconcile loop
#[async_trait]
pub trait ReconcileStep: Send {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Run once against the pass
    async fn reconcile(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome>;
}

/// Runs steps in order, stopping at the first abort
pub struct Sequencer {
    steps: Vec<Box<dyn ReconcileStep>>,
}

impl Sequencer {
    /// Create a sequencer over `steps`
    pub fn new(steps: Vec<Box<dyn ReconcileStep>>) -> Self {
        Self { steps }
    }

    /// Names of the steps, in run order
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step until one errors or asks to requeue
    pub async fn run(&mut self, pass: &mut Pass) -> Result<ReconcileOutcome> {
        let db = pass.vdb.name_any();
        for step in &mut self.steps {
            let name = step.name();
            debug!(vdb = %db, step = name, "running step");
            let outcome = match step.reconcile(pass).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(vdb = %db, step = name, error = %e, "step failed");
                    return Err(e);
                }
            };
            if outcome.is_abort() {
                info!(vdb = %db, step = name, ?outcome, "step requested requeue");
                return Ok(outcome);
            }
        }
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use rstest::rstest;
    use vdb_common::Error;

    use crate::podfacts::MockFactGatherer;
    use crate::testing::sample_vdb;

    struct Scripted {
        name: &'static str,
        // None fails the step
        result: Option<ReconcileOutcome>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ReconcileStep for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn reconcile(&mut self, _pass: &mut Pass) -> Result<ReconcileOutcome> {
            self.log.lock().expect("lock").push(self.name);
            self.result
                .ok_or_else(|| Error::admin("add_node", "boom"))
        }
    }

    fn pass() -> Pass {
        Pass::new(
            sample_vdb("vertdb"),
            PodFacts::new(Arc::new(MockFactGatherer::new())),
        )
    }

    fn sequencer(
        results: Vec<(&'static str, Option<ReconcileOutcome>)>,
    ) -> (Sequencer, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let steps = results
            .into_iter()
            .map(|(name, result)| {
                Box::new(Scripted {
                    name,
                    result,
                    log: log.clone(),
                }) as Box<dyn ReconcileStep>
            })
            .collect();
        (Sequencer::new(steps), log)
    }

    #[tokio::test]
    async fn all_done_runs_every_step() {
        let (mut seq, log) = sequencer(vec![
            ("a", Some(ReconcileOutcome::Done)),
            ("b", Some(ReconcileOutcome::Done)),
        ]);
        let outcome = seq.run(&mut pass()).await.expect("run");
        assert_eq!(outcome, ReconcileOutcome::Done);
        assert_eq!(*log.lock().expect("lock"), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn requeue_short_circuits() {
        let (mut seq, log) = sequencer(vec![
            ("a", Some(ReconcileOutcome::RequeueNow)),
            ("b", Some(ReconcileOutcome::Done)),
        ]);
        let outcome = seq.run(&mut pass()).await.expect("run");
        assert_eq!(outcome, ReconcileOutcome::RequeueNow);
        assert_eq!(*log.lock().expect("lock"), vec!["a"]);
    }

    #[tokio::test]
    async fn error_short_circuits() {
        let (mut seq, log) = sequencer(vec![
            ("a", None),
            ("b", Some(ReconcileOutcome::Done)),
        ]);
        assert!(seq.run(&mut pass()).await.is_err());
        assert_eq!(*log.lock().expect("lock"), vec!["a"]);
        assert_eq!(seq.step_names(), vec!["a", "b"]);
    }

    #[rstest]
    #[case(ReconcileOutcome::Done, ReconcileOutcome::Done, ReconcileOutcome::Done)]
    #[case(ReconcileOutcome::Done, ReconcileOutcome::RequeueNow, ReconcileOutcome::RequeueNow)]
    #[case(
        ReconcileOutcome::RequeueAfter(Duration::from_secs(30)),
        ReconcileOutcome::RequeueAfter(Duration::from_secs(10)),
        ReconcileOutcome::RequeueAfter(Duration::from_secs(10))
    )]
    #[case(
        ReconcileOutcome::RequeueAfter(Duration::from_secs(30)),
        ReconcileOutcome::RequeueNow,
        ReconcileOutcome::RequeueNow
    )]
    fn merge_keeps_the_most_urgent(
        #[case] a: ReconcileOutcome,
        #[case] b: ReconcileOutcome,
        #[case] expected: ReconcileOutcome,
    ) {
        assert_eq!(a.merge(b), expected);
        assert_eq!(b.merge(a), expected);
    }
}
