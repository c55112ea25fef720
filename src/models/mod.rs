use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollOption {
    pub id: String,
    pub text: String,
    pub votes: i64,
}

// Body of a submission, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    #[serde(default)]
    pub poll_id: Option<String>,
    #[serde(default)]
    pub option_id: Option<String>,
    #[serde(default, alias = "userId")]
    pub voter_id: Option<String>,
}

impl VoteRequest {
    pub fn new(poll_id: &str, option_id: &str, voter_id: &str) -> Self {
        Self {
            poll_id: Some(poll_id.to_string()),
            option_id: Some(option_id.to_string()),
            voter_id: Some(voter_id.to_string()),
        }
    }
}

/// Value of a record on the `raw-votes` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRecord {
    pub poll_id: String,
    pub option_id: String,
    pub voter_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Value of a record on the `poll-updates` topic, and the payload pushed to
/// observers as a `poll-stats` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEvent {
    pub option_id: String,
    pub poll_id: String,
    pub new_count: i64,
}

impl Poll {
    pub fn new(question: String, options: Vec<String>) -> Self {
        let options = options
            .into_iter()
            .map(|text| PollOption {
                id: Uuid::new_v4().to_string(),
                text,
                votes: 0,
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            question,
            options,
            created_at: Utc::now(),
        }
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vote_request_accepts_user_id_alias() {
        let request: VoteRequest =
            serde_json::from_str(r#"{"pollId":"1","optionId":"2","userId":"u1"}"#).unwrap();
        assert_eq!(request.voter_id.as_deref(), Some("u1"));
        assert_eq!(request.poll_id.as_deref(), Some("1"));
    }

    #[test]
    fn vote_request_tolerates_missing_fields() {
        let request: VoteRequest = serde_json::from_str(r#"{"pollId":"1"}"#).unwrap();
        assert!(request.option_id.is_none());
        assert!(request.voter_id.is_none());
    }

    #[test]
    fn update_event_uses_wire_field_names() {
        let event = UpdateEvent {
            option_id: "2".to_string(),
            poll_id: "1".to_string(),
            new_count: 7,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["optionId"], "2");
        assert_eq!(json["pollId"], "1");
        assert_eq!(json["newCount"], 7);
    }

    #[test]
    fn new_poll_starts_with_zero_votes() {
        let poll = Poll::new("Lunch?".to_string(), vec!["Pizza".into(), "Tacos".into()]);
        assert_eq!(poll.options.len(), 2);
        assert!(poll.options.iter().all(|o| o.votes == 0));
        assert_ne!(poll.options[0].id, poll.options[1].id);
        assert!(poll.option(&poll.options[1].id).is_some());
    }
}
