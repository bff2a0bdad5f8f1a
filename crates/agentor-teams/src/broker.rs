use crate::events::{EventBus, TeamEvent};
use crate::store::TeamsDatabase;
use crate::types::{MessageQuery, MessageType, NewMessage, TeamMessage};
use agentor_core::{AgentorError, AgentorResult, Entity};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::debug;
use uuid::Uuid;

/// Callback invoked synchronously for every delivered message.
pub type MessageCallback = Arc<dyn Fn(&TeamMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Topic {
    Team(Uuid),
    Teammate(Uuid),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<Topic, Vec<(u64, MessageCallback)>>,
}

impl Registry {
    fn add(&mut self, topic: Topic, callback: MessageCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.topics.entry(topic).or_default().push((id, callback));
        id
    }

    fn remove(&mut self, topic: Topic, id: u64) -> bool {
        let Some(subs) = self.topics.get_mut(&topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|(sub_id, _)| *sub_id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            self.topics.remove(&topic);
        }
        removed
    }

    fn callbacks(&self, topic: Topic) -> Vec<MessageCallback> {
        self.topics
            .get(&topic)
            .map(|subs| subs.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }
}

/// Handle returned by the `subscribe_*` methods. Dropping it unsubscribes.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    topic: Topic,
    id: u64,
}

impl Subscription {
    /// Stop receiving messages. Returns false if the subscription was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().remove(self.topic, self.id),
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("id", &self.id)
            .finish()
    }
}

/// Persists team messages and fans them out to in-process subscribers.
///
/// A `p2p` message with a recipient reaches only that teammate's subscribers; every
/// other message reaches the team's subscribers. Callbacks run on the sending task, in
/// registration order, after the message is stored.
pub struct MessageBroker {
    db: Arc<dyn TeamsDatabase>,
    events: EventBus,
    registry: Arc<Mutex<Registry>>,
    page_size: usize,
}

impl MessageBroker {
    pub fn new(db: Arc<dyn TeamsDatabase>, events: EventBus, page_size: usize) -> Self {
        Self {
            db,
            events,
            registry: Arc::new(Mutex::new(Registry::default())),
            page_size: page_size.max(1),
        }
    }

    pub async fn send_message(&self, message: NewMessage) -> AgentorResult<TeamMessage> {
        if self.db.get_team(message.team_id).await?.is_none() {
            return Err(AgentorError::not_found(Entity::Team, message.team_id));
        }
        let message = TeamMessage::new(message);
        self.db.create_message(&message).await?;

        let topic = match (message.message_type, message.to_teammate_id) {
            (MessageType::P2p, Some(to)) => Topic::Teammate(to),
            _ => Topic::Team(message.team_id),
        };
        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks = self.registry.lock().callbacks(topic);
        debug!(
            team_id = %message.team_id,
            message_type = ?message.message_type,
            subject = %message.subject,
            subscribers = callbacks.len(),
            "Message sent"
        );
        for callback in callbacks {
            callback(&message);
        }

        self.events.publish(TeamEvent::MessageReceived(message.clone()));
        Ok(message)
    }

    pub async fn broadcast_message(
        &self,
        team_id: Uuid,
        from: Option<Uuid>,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> AgentorResult<TeamMessage> {
        self.send_message(
            NewMessage::new(team_id, MessageType::Broadcast, subject)
                .with_content(content)
                .from_teammate(from),
        )
        .await
    }

    pub async fn send_p2p_message(
        &self,
        team_id: Uuid,
        from: Option<Uuid>,
        to: Uuid,
        subject: impl Into<String>,
        content: impl Into<String>,
    ) -> AgentorResult<TeamMessage> {
        self.send_message(
            NewMessage::new(team_id, MessageType::P2p, subject)
                .with_content(content)
                .from_teammate(from)
                .to_teammate(to),
        )
        .await
    }

    pub fn subscribe_to_messages<F>(&self, team_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(&TeamMessage) + Send + Sync + 'static,
    {
        self.subscribe(Topic::Team(team_id), Arc::new(callback))
    }

    pub fn subscribe_to_teammate_messages<F>(&self, teammate_id: Uuid, callback: F) -> Subscription
    where
        F: Fn(&TeamMessage) + Send + Sync + 'static,
    {
        self.subscribe(Topic::Teammate(teammate_id), Arc::new(callback))
    }

    fn subscribe(&self, topic: Topic, callback: MessageCallback) -> Subscription {
        let id = self.registry.lock().add(topic, callback);
        Subscription {
            registry: Arc::downgrade(&self.registry),
            topic,
            id,
        }
    }

    /// Chronological page of a team's messages. A query without a limit gets the
    /// configured page size.
    pub async fn get_messages(&self, query: &MessageQuery) -> AgentorResult<Vec<TeamMessage>> {
        if query.limit.is_some() {
            return self.db.list_messages(query).await;
        }
        let mut paged = query.clone();
        paged.limit = Some(self.page_size);
        self.db.list_messages(&paged).await
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().topics.values().map(Vec::len).sum()
    }
}
