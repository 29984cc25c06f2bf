//! Pending connection sequencing with scripted tasks.

use concert::client::{
    BoxedConnectionTask, ConnectionOutcome, ConnectionResultCode, ConnectionTask,
    PendingConnection, TaskStatus,
};

#[derive(Default)]
struct Journal {
    executed: Vec<&'static str>,
    ticked: Vec<&'static str>,
    aborted: Vec<&'static str>,
}

struct Step {
    name: &'static str,
    result: TaskStatus,
    status: TaskStatus,
}

impl Step {
    fn boxed(name: &'static str, result: TaskStatus) -> BoxedConnectionTask<Journal> {
        Box::new(Self {
            name,
            result,
            status: TaskStatus::Pending,
        })
    }
}

impl ConnectionTask<Journal> for Step {
    fn execute(&mut self, journal: &mut Journal) {
        journal.executed.push(self.name);
    }

    fn tick(&mut self, journal: &mut Journal, _should_cancel: bool) {
        journal.ticked.push(self.name);
        self.status = self.result.clone();
    }

    fn abort(&mut self, journal: &mut Journal) {
        journal.aborted.push(self.name);
    }

    fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    fn description(&self) -> String {
        self.name.to_string()
    }
}

fn failure(reason: &str) -> TaskStatus {
    TaskStatus::Failed(ConnectionOutcome::new(ConnectionResultCode::Failed, reason))
}

#[test]
fn test_failure_stops_the_workflow() {
    let mut journal = Journal::default();
    let (mut pending, mut future) = PendingConnection::execute(
        vec![
            Step::boxed("a", TaskStatus::Success),
            Step::boxed("b", failure("server exploded")),
            Step::boxed("c", TaskStatus::Success),
        ],
        &mut journal,
    );

    let mut ticks = 0;
    while !pending.tick(&mut journal) {
        ticks += 1;
        assert!(ticks < 10, "workflow never finished");
    }

    assert_eq!(
        future.try_outcome(),
        Some(ConnectionOutcome::new(ConnectionResultCode::Failed, "server exploded"))
    );
    assert_eq!(journal.executed, vec!["a", "b"]);
    assert_eq!(journal.ticked, vec!["a", "b"]);
    assert!(journal.aborted.is_empty());
    assert!(future.try_outcome().is_none(), "outcome is taken once");
}

#[test]
fn test_finished_workflow_ignores_further_ticks() {
    let mut journal = Journal::default();
    let (mut pending, mut future) =
        PendingConnection::execute(vec![Step::boxed("a", TaskStatus::Success)], &mut journal);
    assert!(pending.tick(&mut journal));
    assert!(pending.tick(&mut journal));
    assert_eq!(journal.ticked, vec!["a"]);
    assert_eq!(future.try_outcome().map(|o| o.code), Some(ConnectionResultCode::Success));
    drop(pending);
}

#[tokio::test]
async fn test_future_can_be_awaited() {
    let mut journal = Journal::default();
    let (mut pending, future) =
        PendingConnection::execute(vec![Step::boxed("a", failure("nope"))], &mut journal);
    pending.tick(&mut journal);
    let outcome = future.await;
    assert_eq!(outcome.code, ConnectionResultCode::Failed);
    assert_eq!(outcome.reason, "nope");
}
