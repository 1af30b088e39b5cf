use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::paths;

/// Logical conversation identifier: the global room or one private peer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TopicKey {
    Global,
    Direct(String),
}

impl TopicKey {
    pub fn direct(peer_id: impl Into<String>) -> Self {
        Self::Direct(peer_id.into())
    }

    /// Parse `global`, `dm:<peer>` or a bare peer id.
    /// Returns None for empty input and for peer ids that cannot name a
    /// private collection.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if input.eq_ignore_ascii_case("global") {
            return Some(Self::Global);
        }
        let peer = input.strip_prefix("dm:").unwrap_or(input).trim();
        if is_valid_participant(peer) {
            Some(Self::Direct(peer.to_string()))
        } else {
            None
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Self::Global)
    }

    /// Collection path of this topic in the backing store.
    ///
    /// - global: `artifacts/{app_id}/public/data/messages`
    /// - direct: `artifacts/{app_id}/private/{a}__{b}/messages` with the two
    ///   participant ids sorted, so both peers address the same collection.
    ///   Only unambiguous for ids passing [`is_valid_participant`].
    pub fn collection_path(&self, app_id: &str, self_id: &str) -> String {
        match self {
            Self::Global => [
                paths::ROOT,
                app_id,
                paths::PUBLIC,
                paths::PUBLIC_DATA,
                paths::MESSAGES,
            ]
            .join("/"),
            Self::Direct(peer) => {
                let (a, b) = if self_id <= peer.as_str() {
                    (self_id, peer.as_str())
                } else {
                    (peer.as_str(), self_id)
                };
                let pair = format!("{a}{}{b}", paths::PAIR_SEPARATOR);
                [paths::ROOT, app_id, paths::PRIVATE, &pair, paths::MESSAGES].join("/")
            }
        }
    }
}

/// Whether `id` can take part in a private conversation. The pair segment of
/// the collection path only maps back to one pair of ids when neither id
/// contains the pair separator or a path separator.
pub fn is_valid_participant(id: &str) -> bool {
    !id.is_empty() && !id.contains(paths::PAIR_SEPARATOR) && !id.contains('/')
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Direct(peer) => write!(f, "dm:{peer}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(TopicKey::parse("global"), Some(TopicKey::Global));
        assert_eq!(TopicKey::parse(" GLOBAL "), Some(TopicKey::Global));
        assert_eq!(TopicKey::parse("dm:peer-1"), Some(TopicKey::direct("peer-1")));
        assert_eq!(TopicKey::parse("peer-1"), Some(TopicKey::direct("peer-1")));
        assert_eq!(TopicKey::parse(""), None);
        assert_eq!(TopicKey::parse("dm:"), None);
        assert_eq!(TopicKey::parse("dm:b__c"), None);
        assert_eq!(TopicKey::parse("dm:x/y"), None);
    }

    #[test]
    fn test_participant_ids() {
        assert!(is_valid_participant("alice-123"));
        assert!(is_valid_participant("a_b"));
        assert!(!is_valid_participant(""));
        assert!(!is_valid_participant("a__b"));
        assert!(!is_valid_participant("a/b"));
    }

    #[test]
    fn test_display_parses_back() {
        for key in [TopicKey::Global, TopicKey::direct("bob")] {
            assert_eq!(TopicKey::parse(&key.to_string()), Some(key));
        }
    }

    #[test]
    fn test_global_collection_path() {
        assert_eq!(
            TopicKey::Global.collection_path("my-app", "alice"),
            "artifacts/my-app/public/data/messages"
        );
    }

    #[test]
    fn test_direct_collection_path_is_shared_by_both_peers() {
        let from_alice = TopicKey::direct("bob").collection_path("app", "alice");
        let from_bob = TopicKey::direct("alice").collection_path("app", "bob");
        assert_eq!(from_alice, "artifacts/app/private/alice__bob/messages");
        assert_eq!(from_alice, from_bob);
    }
}
