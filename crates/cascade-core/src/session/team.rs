//! Team-mode event parsing.
//!
//! A `team_spawn` process interleaves free-form output with NDJSON
//! announcement events. Each stdout line that parses as JSON with a
//! recognized `event` field updates the session's `TeamState`; everything
//! else is ordinary output and passes through untouched.

use serde::Deserialize;

use crate::models::{TeamMember, TeamState, TeamTask, TeamTaskStatus};

/// Recognized announcement events, tagged by the `event` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TeamEvent {
    TeamCreated {
        name: String,
    },
    MemberAdded {
        name: String,
        agent_id: String,
        #[serde(default)]
        agent_type: Option<String>,
    },
    TaskCreated {
        id: String,
        subject: String,
        #[serde(default)]
        owner: Option<String>,
    },
    TaskStatus {
        id: String,
        status: TeamTaskStatus,
    },
}

impl TeamEvent {
    /// Try to parse one output line as an announcement event. Returns None
    /// for non-JSON lines and for JSON without a recognized `event` field.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Fold one event into the team state.
pub fn apply_event(state: &mut TeamState, event: TeamEvent) {
    match event {
        TeamEvent::TeamCreated { name } => {
            state.team_name = Some(name);
        }
        TeamEvent::MemberAdded {
            name,
            agent_id,
            agent_type,
        } => {
            // Re-announcing the same agent replaces the earlier record.
            state.members.retain(|m| m.agent_id != agent_id);
            state.members.push(TeamMember {
                name,
                agent_id,
                agent_type: agent_type.unwrap_or_else(|| "worker".to_string()),
            });
        }
        TeamEvent::TaskCreated { id, subject, owner } => {
            if state.tasks.iter().any(|t| t.id == id) {
                return;
            }
            state.tasks.push(TeamTask {
                id,
                subject,
                status: TeamTaskStatus::Pending,
                owner,
            });
        }
        TeamEvent::TaskStatus { id, status } => {
            if let Some(task) = state.tasks.iter_mut().find(|t| t.id == id) {
                task.status = status;
            } else {
                tracing::debug!("[Team] Status for unknown task '{}', ignoring", id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(state: &mut TeamState, lines: &[&str]) {
        for line in lines {
            if let Some(event) = TeamEvent::parse(line) {
                apply_event(state, event);
            }
        }
    }

    #[test]
    fn test_full_announcement_sequence() {
        let mut state = TeamState::default();
        feed(
            &mut state,
            &[
                "booting up...",
                r#"{"event":"team_created","name":"release-train"}"#,
                r#"{"event":"member_added","name":"Reviewer","agent_id":"rev-1","agent_type":"reviewer"}"#,
                r#"{"event":"task_created","id":"t1","subject":"Review diff","owner":"rev-1"}"#,
                "working on it",
                r#"{"event":"task_status","id":"t1","status":"in_progress"}"#,
                r#"{"event":"task_status","id":"t1","status":"completed"}"#,
            ],
        );

        assert_eq!(state.team_name.as_deref(), Some("release-train"));
        assert_eq!(state.members.len(), 1);
        assert_eq!(state.members[0].agent_id, "rev-1");
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].status, TeamTaskStatus::Completed);
    }

    #[test]
    fn test_non_event_lines_are_ignored() {
        assert!(TeamEvent::parse("plain text").is_none());
        assert!(TeamEvent::parse(r#"{"not_an_event": true}"#).is_none());
        assert!(TeamEvent::parse(r#"{"event":"unknown_kind","x":1}"#).is_none());
    }

    #[test]
    fn test_status_for_unknown_task_is_ignored() {
        let mut state = TeamState::default();
        feed(&mut state, &[r#"{"event":"task_status","id":"ghost","status":"completed"}"#]);
        assert!(state.tasks.is_empty());
    }

    #[test]
    fn test_duplicate_task_and_member_announcements() {
        let mut state = TeamState::default();
        feed(
            &mut state,
            &[
                r#"{"event":"member_added","name":"A","agent_id":"a1"}"#,
                r#"{"event":"member_added","name":"A (renamed)","agent_id":"a1"}"#,
                r#"{"event":"task_created","id":"t1","subject":"first"}"#,
                r#"{"event":"task_created","id":"t1","subject":"dup"}"#,
            ],
        );
        assert_eq!(state.members.len(), 1);
        assert_eq!(state.members[0].name, "A (renamed)");
        assert_eq!(state.tasks.len(), 1);
        assert_eq!(state.tasks[0].subject, "first");
    }
}
