//! Tag keys marking provider resources as owned by gsm
//!
//! Every resource gsm creates carries [`ID`]. Listings filter on that key,
//! and the reconciler rebuilds records from the rest.

use crate::provider::Tags;

/// Stable server identifier. Presence marks a resource as system-owned.
pub const ID: &str = "gsm:id";
pub const GAME: &str = "gsm:game";
pub const NAME: &str = "gsm:name";
pub const SECURITY_GROUP: &str = "gsm:sg-id";
pub const VOLUME: &str = "gsm:volume-id";
pub const PORTS: &str = "gsm:ports";
pub const CONTAINER_NAME: &str = "gsm:container-name";
pub const LAUNCH_TIME: &str = "gsm:launch-time";
pub const ADDRESS_ALLOCATION: &str = "gsm:eip-alloc-id";
pub const CONTAINER_STOPPED: &str = "gsm:container-stopped";
pub const SNAPSHOT_ID: &str = "gsm:snapshot-id";

/// Client token of an allocation, for providers without native tokens
pub const CLIENT_TOKEN: &str = "gsm:client-token";

/// Provider display name tag
pub const DISPLAY_NAME: &str = "Name";

/// Build a tag map from key/value pairs
pub fn tags<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Tags {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Whether the tag map marks a system-owned resource
pub fn is_managed(tags: &Tags) -> bool {
    tags.get(ID).is_some_and(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_managed() {
        assert!(is_managed(&tags([(ID, "abc123")])));
        assert!(!is_managed(&tags([(ID, "")])));
        assert!(!is_managed(&tags([(DISPLAY_NAME, "web")])));
    }
}
