//! Connection routing core: registry states, FIFO matching, the in-process
//! conversation store, message relay and the disconnect state machine.
//!
//! All shared state lives behind `AppState::registry`, a single mutex that is
//! only ever held across pure mutation. Outbound frames are collected while
//! the lock is held and handed to per-connection writer queues afterwards, so
//! a slow or dead peer can never stall the registry or a broadcast.

use std::sync::{atomic::Ordering, Arc};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{
    AgentIdentity, AppState, ChatMessage, ConnSender, ConnState, Conversation, ConversationStatus,
    HistoryEntry, JoinPayload, Outbound, Registry, WaitingGuest, NOT_PROVIDED, SENDER_AGENT,
    SENDER_BOT, SENDER_CLIENT,
};

const LINKED_MARKER: &str = "Agent connected.";
const CLOSED_MARKER: &str = "Conversation closed.";
const FALLBACK_FIRST_MESSAGE: &str = "client started chat";
const QUEUED_RECEIPT: &str =
    "Your message has been received and will be delivered to the next available agent.";
const QUEUE_WAIT_ESTIMATE_MINUTES: u32 = 5;

type Effects = Vec<(ConnSender, Outbound)>;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn clock_time() -> String {
    Utc::now().format("%H:%M").to_string()
}

fn text_frame(value: Value) -> Outbound {
    Outbound::Text(value.to_string())
}

/// Deliver collected frames. Run after the registry lock is dropped; a send
/// only fails when the peer's writer is already gone, which is logged and
/// isolated per recipient.
fn dispatch(effects: Effects) {
    for (sender, frame) in effects {
        if sender.send(frame).is_err() {
            debug!("dropping frame for a peer whose writer is gone");
        }
    }
}

fn push_to(reg: &Registry, effects: &mut Effects, conn_id: usize, event: Value) {
    if let Some(sender) = reg.clients.get(&conn_id) {
        effects.push((sender.clone(), text_frame(event)));
    }
}

fn push_agent_broadcast(reg: &Registry, effects: &mut Effects, event: Value) {
    let frame = event.to_string();
    for conn_id in reg.agents.keys() {
        if let Some(sender) = reg.clients.get(conn_id) {
            effects.push((sender.clone(), Outbound::Text(frame.clone())));
        }
    }
}

fn history_to_message(entry: &HistoryEntry) -> ChatMessage {
    ChatMessage {
        id: Uuid::new_v4().to_string(),
        content: entry.text.clone(),
        sender: if entry.is_bot { SENDER_BOT } else { SENDER_CLIENT }.to_string(),
        timestamp: entry.timestamp.clone().unwrap_or_else(now_iso),
        status: "sent".to_string(),
    }
}

/// Build the initial conversation record for a fresh guest: the pre-chat
/// transcript first, then the synthesized lead message, in that order.
fn build_conversation(guest_id: &str, join: &JoinPayload) -> Conversation {
    let user_data = &join.user_data;

    let first_content = user_data
        .message
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| FALLBACK_FIRST_MESSAGE.to_string());

    let mut messages: Vec<ChatMessage> =
        join.conversation_history.iter().map(history_to_message).collect();
    messages.push(ChatMessage {
        id: Uuid::new_v4().to_string(),
        content: first_content.clone(),
        sender: SENDER_CLIENT.to_string(),
        timestamp: user_data.timestamp.clone().unwrap_or_else(now_iso),
        status: "sent".to_string(),
    });

    let client_name = user_data
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("Guest {}", &guest_id[..4.min(guest_id.len())]));

    let field = |value: &Option<String>| {
        value
            .clone()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| NOT_PROVIDED.to_string())
    };

    Conversation {
        id: guest_id.to_string(),
        client_name,
        last_message: first_content,
        unread: 1,
        time: clock_time(),
        status: ConversationStatus::Waiting,
        client_info: crate::types::ClientInfo {
            email: field(&user_data.email),
            phone: field(&user_data.phone),
            source: field(&user_data.source),
            time_on_page: field(&user_data.time_on_page),
            project: field(&user_data.project),
            urgency: field(&user_data.urgency),
        },
        messages,
        tags: vec!["new-lead".to_string()],
        agent_name: None,
    }
}

/// Pair a guest with an agent. Both directions of the link are written in the
/// same critical section, the conversation flips waiting -> active, and the
/// updated record is returned so the caller can fan it out to dashboards.
fn link_session(
    reg: &mut Registry,
    guest_conn: usize,
    agent_conn: usize,
    identity: &AgentIdentity,
    guest_id: &str,
) -> Option<Conversation> {
    reg.sessions.insert(guest_conn, agent_conn);
    reg.reverse_sessions.insert(agent_conn, guest_conn);
    reg.states.insert(guest_conn, ConnState::InSession);
    reg.states.insert(agent_conn, ConnState::InSession);

    let conv = reg.conversations.get_mut(guest_id)?;
    conv.status = ConversationStatus::Active;
    conv.agent_name = Some(identity.name.clone());
    conv.unread = 0;
    conv.last_message = LINKED_MARKER.to_string();
    Some(conv.clone())
}

/// Register a brand-new connection before its first frame is read. The
/// connection holds no routing state until it authenticates or joins.
pub async fn register_connection(state: &Arc<AppState>, tx: ConnSender) -> usize {
    let conn_id = state.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
    let mut reg = state.registry.lock().await;
    reg.clients.insert(conn_id, tx);
    reg.states.insert(conn_id, ConnState::Pending);
    conn_id
}

/// An authenticated agent came online: match it with the longest-waiting
/// guest, or park it at the tail of the available pool.
pub async fn connect_agent(state: &Arc<AppState>, conn_id: usize, identity: AgentIdentity) {
    let mut effects: Effects = Vec::new();
    {
        let mut reg = state.registry.lock().await;
        reg.agents.insert(conn_id, identity.clone());

        if let Some(guest) = reg.waiting_guests.pop_front() {
            let updated = link_session(&mut reg, guest.conn_id, conn_id, &identity, &guest.guest_id);
            push_to(
                &reg,
                &mut effects,
                guest.conn_id,
                json!({
                    "type": "transfer_status",
                    "status": "connected",
                    "agentName": identity.name,
                    "agentRole": "Support Agent",
                }),
            );
            push_to(
                &reg,
                &mut effects,
                conn_id,
                json!({
                    "type": "new_conversation",
                    "guest_id": &guest.guest_id,
                    "userData": guest.join.user_data,
                    "conversationHistory": guest.join.conversation_history,
                }),
            );
            if let Some(conversation) = updated {
                push_agent_broadcast(
                    &reg,
                    &mut effects,
                    json!({ "type": "conversation_update", "conversation": conversation }),
                );
            }
            info!(agent = %identity.email, guest_id = %guest.guest_id, "agent matched to queued guest");
        } else {
            reg.available_agents.push_back(conn_id);
            reg.states.insert(conn_id, ConnState::Available);
            push_to(
                &reg,
                &mut effects,
                conn_id,
                json!({ "type": "status", "message": "online_waiting" }),
            );
            info!(agent = %identity.email, "agent online and waiting");
        }
    }
    dispatch(effects);
}

/// A guest joined: create its conversation, then match it with the
/// longest-idle agent or append it to the waiting queue.
pub async fn connect_guest(state: &Arc<AppState>, conn_id: usize, join: JoinPayload) {
    let guest_id = Uuid::new_v4().to_string();
    let conversation = build_conversation(&guest_id, &join);

    let mut effects: Effects = Vec::new();
    {
        let mut reg = state.registry.lock().await;
        reg.guest_ids.insert(conn_id, guest_id.clone());
        reg.conversations.insert(guest_id.clone(), conversation.clone());

        let popped = reg.available_agents.pop_front();
        let matched = popped.and_then(|agent_conn| {
            reg.agents
                .get(&agent_conn)
                .cloned()
                .map(|identity| (agent_conn, identity))
        });

        if let Some((agent_conn, identity)) = matched {
            let updated = link_session(&mut reg, conn_id, agent_conn, &identity, &guest_id);
            push_to(
                &reg,
                &mut effects,
                conn_id,
                json!({
                    "type": "transfer_status",
                    "status": "connected",
                    "agentName": identity.name,
                    "agentRole": "Support Agent",
                }),
            );
            let full = updated.unwrap_or(conversation);
            push_to(
                &reg,
                &mut effects,
                agent_conn,
                json!({ "type": "new_conversation", "conversation": &full }),
            );
            push_agent_broadcast(
                &reg,
                &mut effects,
                json!({ "type": "conversation_update", "conversation": &full }),
            );
            info!(guest_id = %guest_id, agent = %identity.email, "guest matched to idle agent");
        } else {
            reg.waiting_guests.push_back(WaitingGuest {
                conn_id,
                join,
                guest_id: guest_id.clone(),
            });
            reg.states.insert(conn_id, ConnState::Queued);
            let position = reg.waiting_guests.len();

            push_agent_broadcast(
                &reg,
                &mut effects,
                json!({ "type": "new_waiting_guest", "conversation": conversation }),
            );
            push_to(
                &reg,
                &mut effects,
                conn_id,
                json!({
                    "type": "transfer_status",
                    "status": "waiting",
                    "position": position,
                    "waitTime": QUEUE_WAIT_ESTIMATE_MINUTES,
                }),
            );
            info!(guest_id = %guest_id, position, "guest queued, no agents available");
        }
    }
    dispatch(effects);
}

/// Relay a guest message to its linked agent, or buffer it onto the retained
/// join transcript while the guest is still queued. A guest in neither state
/// is an orphaned send: logged and dropped.
pub async fn route_guest_message(
    state: &Arc<AppState>,
    conn_id: usize,
    message: &str,
    timestamp: Option<String>,
) {
    let ts = timestamp.unwrap_or_else(now_iso);
    let mut effects: Effects = Vec::new();
    {
        let mut reg = state.registry.lock().await;

        if let Some(agent_conn) = reg.sessions.get(&conn_id).copied() {
            push_to(
                &reg,
                &mut effects,
                agent_conn,
                json!({ "type": "client_message", "message": message, "timestamp": &ts }),
            );
            if let Some(guest_id) = reg.guest_ids.get(&conn_id).cloned() {
                if let Some(conv) = reg.conversations.get_mut(&guest_id) {
                    conv.messages.push(ChatMessage {
                        id: Uuid::new_v4().to_string(),
                        content: message.to_string(),
                        sender: SENDER_CLIENT.to_string(),
                        timestamp: ts,
                        status: "sent".to_string(),
                    });
                    conv.last_message = message.to_string();
                    conv.unread += 1;
                }
            }
        } else if let Some(entry) =
            reg.waiting_guests.iter_mut().find(|g| g.conn_id == conn_id)
        {
            entry.join.conversation_history.push(HistoryEntry {
                text: message.to_string(),
                is_bot: false,
                timestamp: Some(ts.clone()),
            });
            let guest_id = entry.guest_id.clone();
            if let Some(conv) = reg.conversations.get_mut(&guest_id) {
                conv.messages.push(ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    content: message.to_string(),
                    sender: SENDER_CLIENT.to_string(),
                    timestamp: ts,
                    status: "sent".to_string(),
                });
                conv.last_message = message.to_string();
                conv.unread += 1;
            }
            push_to(
                &reg,
                &mut effects,
                conn_id,
                json!({ "type": "agent_message", "message": QUEUED_RECEIPT }),
            );
            debug!(conn_id, guest_id = %guest_id, "buffered message from queued guest");
        } else {
            warn!(conn_id, "guest message with no session and no queue entry, dropping");
        }
    }
    dispatch(effects);
}

/// Relay an agent message to its linked guest. An agent with no active
/// session is an orphaned send: logged and dropped, never an error.
pub async fn route_agent_message(state: &Arc<AppState>, conn_id: usize, message: &str) {
    let mut effects: Effects = Vec::new();
    {
        let mut reg = state.registry.lock().await;

        let Some(guest_conn) = reg.reverse_sessions.get(&conn_id).copied() else {
            warn!(conn_id, "agent message with no active session, dropping");
            return;
        };

        push_to(
            &reg,
            &mut effects,
            guest_conn,
            json!({ "type": "agent_message", "message": message }),
        );
        if let Some(guest_id) = reg.guest_ids.get(&guest_conn).cloned() {
            if let Some(conv) = reg.conversations.get_mut(&guest_id) {
                conv.messages.push(ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    content: message.to_string(),
                    sender: SENDER_AGENT.to_string(),
                    timestamp: now_iso(),
                    status: "sent".to_string(),
                });
                conv.last_message = message.to_string();
            }
        }
    }
    dispatch(effects);
}

/// Typing indicators are best-effort: forwarded only when a session exists,
/// silently a no-op otherwise.
pub async fn route_typing(state: &Arc<AppState>, conn_id: usize, typing: bool) {
    let mut effects: Effects = Vec::new();
    {
        let reg = state.registry.lock().await;
        if let Some(&guest_conn) = reg.reverse_sessions.get(&conn_id) {
            push_to(
                &reg,
                &mut effects,
                guest_conn,
                json!({ "type": "agent_typing", "typing": typing }),
            );
        }
    }
    dispatch(effects);
}

/// Teardown state machine. Branches on whichever registry state the
/// connection held and unwinds exactly that; idempotent, so a second call for
/// the same connection (or a call for one never registered) does nothing.
pub async fn disconnect(state: &Arc<AppState>, conn_id: usize) {
    let mut effects: Effects = Vec::new();
    {
        let mut reg = state.registry.lock().await;
        if reg.clients.remove(&conn_id).is_none() {
            return;
        }
        reg.states.remove(&conn_id);
        reg.agents.remove(&conn_id);

        let mut closed_guest_id: Option<String> = None;

        if let Some(pos) = reg.available_agents.iter().position(|&id| id == conn_id) {
            reg.available_agents.remove(pos);
            debug!(conn_id, "idle agent disconnected");
        } else if let Some(guest_conn) = reg.reverse_sessions.remove(&conn_id) {
            // In-session agent left: the guest is notified and its connection
            // closed, ending the conversation.
            reg.sessions.remove(&guest_conn);
            closed_guest_id = reg.guest_ids.remove(&guest_conn);
            push_to(
                &reg,
                &mut effects,
                guest_conn,
                json!({ "type": "agent_left", "message": "The agent has disconnected." }),
            );
            if let Some(sender) = reg.clients.remove(&guest_conn) {
                effects.push((
                    sender,
                    Outbound::Close {
                        code: 1000,
                        reason: "agent disconnected".to_string(),
                    },
                ));
            }
            reg.states.remove(&guest_conn);
            debug!(conn_id, guest_id = ?closed_guest_id, "in-session agent disconnected");
        } else if let Some(agent_conn) = reg.sessions.remove(&conn_id) {
            // In-session guest left: the agent is notified and returned to the
            // pool tail, immediately eligible for the next match.
            reg.reverse_sessions.remove(&agent_conn);
            closed_guest_id = reg.guest_ids.remove(&conn_id);
            push_to(
                &reg,
                &mut effects,
                agent_conn,
                json!({ "type": "guest_left", "message": "The guest has disconnected." }),
            );
            if reg.agents.contains_key(&agent_conn) {
                reg.available_agents.push_back(agent_conn);
                reg.states.insert(agent_conn, ConnState::Available);
            }
            debug!(conn_id, guest_id = ?closed_guest_id, "in-session guest disconnected");
        } else {
            // Queued guest, or a pending connection with nothing to unwind.
            reg.waiting_guests.retain(|g| g.conn_id != conn_id);
            closed_guest_id = reg.guest_ids.remove(&conn_id);
        }

        if let Some(guest_id) = closed_guest_id {
            let update = reg.conversations.get_mut(&guest_id).map(|conv| {
                if conv.status != ConversationStatus::Closed {
                    conv.status = ConversationStatus::Closed;
                    conv.last_message = CLOSED_MARKER.to_string();
                }
                conv.clone()
            });
            if let Some(conversation) = update {
                push_agent_broadcast(
                    &reg,
                    &mut effects,
                    json!({ "type": "conversation_update", "conversation": conversation }),
                );
            }
        }
    }
    dispatch(effects);
}

/// Fan an event out to every connected agent, idle or in-session. Failures
/// are isolated per recipient.
pub async fn broadcast_to_agents(state: &Arc<AppState>, event: Value) {
    let effects = {
        let reg = state.registry.lock().await;
        let mut effects: Effects = Vec::new();
        push_agent_broadcast(&reg, &mut effects, event);
        effects
    };
    dispatch(effects);
}

/// Read-model query for the dashboard: every conversation, newest first.
pub async fn conversations_snapshot(state: &Arc<AppState>) -> Vec<Conversation> {
    let reg = state.registry.lock().await;
    let mut list: Vec<Conversation> = reg.conversations.values().cloned().collect();
    list.sort_by(|a, b| b.time.cmp(&a.time));
    list
}

/// Emails of agents currently connected, for the directory endpoint.
pub async fn online_agent_emails(state: &Arc<AppState>) -> Vec<String> {
    let reg = state.registry.lock().await;
    reg.agents.values().map(|id| id.email.clone()).collect()
}
