use std::fmt::{self, Display};

/// A unique identifier for a value tracked by the socket layer.
///
/// Identifiers come from a counter and are never reused, so a stale identifier
/// held by a caller can never alias a newer socket, port or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u64);

impl Id {
    /// Creates an ID with the given number.
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Gets the underlying ID number.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Id);

        impl $name {
            pub const fn new(id: u64) -> Self {
                Self(Id::new(id))
            }

            pub fn id(self) -> Id {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

typed_id!(
    /// The caller-visible handle for a socket.
    SocketId,
    "socket#"
);

typed_id!(
    /// Names one binding of a socket to one adapter.
    PortId,
    "port#"
);

typed_id!(
    /// Names one registered (adapter, protocol variant) pair.
    ServiceId,
    "service#"
);

typed_id!(
    /// Correlates an asynchronous transport operation with its completion.
    Token,
    "token#"
);

/// Hands out increasing identifier numbers.
#[derive(Debug, Default)]
pub(crate) struct IdCounter(u64);

impl IdCounter {
    pub fn next(&mut self) -> u64 {
        self.0 += 1;
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_never_repeats() {
        let mut counter = IdCounter::default();
        let a = SocketId::new(counter.next());
        let b = SocketId::new(counter.next());
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn display_names_the_kind() {
        assert_eq!(PortId::new(7).to_string(), "port#7");
        assert_eq!(Token::new(3).id().into_inner(), 3);
    }
}
