use std::fmt;
use std::sync::Arc;

/// Declares a strongly typed identifier wrapping an `Arc<String>` for cheap
/// cloning across tasks and map keys.
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Arc<String>);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(Arc::new(s))
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(Arc::new(s.to_string()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_type! {
    /// Identifier for a Room (a fan-out scope).
    RoomId
}

id_type! {
    /// Identifier for a User. Stable across reconnects of the same person.
    UserId
}

id_type! {
    /// Identifier for a Peer (one live media transport). Changes on reconnect.
    PeerId
}

id_type! {
    /// Durable session identifier surviving transport loss.
    SessionId
}

id_type! {
    /// Identifier for one WebSocket client connection.
    ClientId
}

id_type! {
    /// Identifier for a published media track.
    TrackId
}

impl PeerId {
    pub fn generate() -> Self {
        PeerId::from(uuid::Uuid::new_v4().to_string())
    }
}

impl ClientId {
    pub fn generate() -> Self {
        ClientId::from(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_id_conversion() {
        let id_str = "room-123";
        let id: RoomId = RoomId::from(id_str);
        assert_eq!(id.as_ref(), id_str);

        let id_string = String::from("room-456");
        let id2: RoomId = RoomId::from(id_string.clone());
        assert_eq!(id2.as_ref(), "room-456");
    }

    #[test]
    fn test_display_trait() {
        let id = UserId::from("user-1");
        assert_eq!(format!("{}", id), "user-1");
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_track_id_conversion() {
        let id = TrackId::from("track-1");
        assert_eq!(id.as_ref(), "track-1");
    }
}
