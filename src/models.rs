use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = u64;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct CollectionId(pub u64);

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ActionId(pub u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection {}", self.0)
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action {}", self.0)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password_hash: String,
    pub phone: String,
    pub image_url: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied at registration, before an id is assigned.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub surname: String,
    pub email: String,
    pub password_hash: String,
    pub phone: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub description: String,
    pub image_url: String,
    /// Creator of the collection, set once at creation.
    pub user_id: UserId,
    pub play_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCollection {
    pub name: String,
    pub description: String,
    pub image_url: String,
}

/// Editable collection fields; an empty `image_url` keeps the stored one.
#[derive(Debug, Clone)]
pub struct CollectionPatch {
    pub name: String,
    pub description: String,
    pub image_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Truth,
    Dare,
}

impl ActionType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "truth" => Some(ActionType::Truth),
            "dare" => Some(ActionType::Dare),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Truth => "truth",
            ActionType::Dare => "dare",
        }
    }
}

/// A single card of a collection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Action {
    pub id: ActionId,
    pub collection_id: CollectionId,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: ActionType,
    pub order: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAction {
    pub text: String,
    pub kind: ActionType,
    /// Zero means "append after the existing cards".
    pub order: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ActionCounts {
    pub total_actions: usize,
    pub truth_count: usize,
    pub dare_count: usize,
}

/// One page of a listing plus the total row count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_type_parses_known_categories_only() {
        assert_eq!(ActionType::parse("truth"), Some(ActionType::Truth));
        assert_eq!(ActionType::parse("dare"), Some(ActionType::Dare));
        assert_eq!(ActionType::parse("Truth"), None);
        assert_eq!(ActionType::parse(""), None);
    }

    #[test]
    fn unknown_stored_category_fails_to_decode() {
        let raw = serde_json::json!({
            "id": 1,
            "collection_id": 1,
            "text": "sing a song",
            "type": "mystery",
            "order": 1,
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        assert!(serde_json::from_value::<Action>(raw).is_err());
    }
}
