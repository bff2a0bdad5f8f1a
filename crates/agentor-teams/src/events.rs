use crate::types::{ExecutionSession, Task, Team, TeamMessage, Teammate};
use serde::Serialize;
use tokio::sync::broadcast;

/// State change pushed to UI-side listeners after every mutation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TeamEvent {
    TeamUpdated(Team),
    TeammateUpdated(Teammate),
    TaskUpdated(Task),
    SessionUpdated(ExecutionSession),
    MessageReceived(TeamMessage),
}

/// Fan-out of [`TeamEvent`]s over a tokio broadcast channel.
/// Publishing never fails; events are dropped when nobody listens.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TeamEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TeamEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TeamEvent) {
        let _ = self.tx.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::NewTeam;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let team = Team::new(NewTeam::new("events"));
        bus.publish(TeamEvent::TeamUpdated(team.clone()));

        match rx.recv().await.unwrap() {
            TeamEvent::TeamUpdated(t) => assert_eq!(t.id, team.id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_listeners_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.listener_count(), 0);
        bus.publish(TeamEvent::TeamUpdated(Team::new(NewTeam::new("nobody"))));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = TeamEvent::TeamUpdated(Team::new(NewTeam::new("tagged")));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "team_updated");
        assert_eq!(json["data"]["name"], "tagged");
    }
}
