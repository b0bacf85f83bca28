use crate::error::{QmuxError, Result};

/// Identifier of a single stream within a connection. Never reused.
pub type StreamId = u64;

/// Which endpoint of the connection we are. Fixed for the connection's
/// lifetime; decides which stream ID parity is ours to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client-initiated streams carry odd IDs, starting at 1.
    Client,
    /// Server-initiated streams carry even IDs, starting at 2.
    Server,
}

impl Role {
    /// The lowest stream ID this role may allocate itself.
    pub fn first_stream_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Who a given stream ID belongs to, from the point of view of `role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    SelfInitiated,
    PeerInitiated,
    Invalid,
}

/// Classify `id` from the point of view of `role`.
///
/// Stream ID 0 is reserved and never names a stream. Otherwise parity
/// decides: odd IDs are client-initiated, even IDs are server-initiated.
pub fn classify(id: StreamId, role: Role) -> Classification {
    if id == 0 {
        return Classification::Invalid;
    }
    let client_initiated = id % 2 == 1;
    match (role, client_initiated) {
        (Role::Client, true) | (Role::Server, false) => Classification::SelfInitiated,
        (Role::Client, false) | (Role::Server, true) => Classification::PeerInitiated,
    }
}

/// Validate an incoming stream ID before the table mutates any state.
///
/// Fails when the parity does not mark the ID as peer-initiated, or when the
/// ID lies below one that a previous, higher incoming ID would already have
/// implicitly opened. An ID once skipped over can never be opened afterwards.
pub fn validate_incoming(
    id: StreamId,
    role: Role,
    highest_peer_id: Option<StreamId>,
) -> Result<()> {
    if classify(id, role) != Classification::PeerInitiated {
        return Err(QmuxError::InvalidStreamId(id));
    }
    if let Some(highest) = highest_peer_id {
        if id < highest {
            return Err(QmuxError::InvalidStreamId(id));
        }
    }
    Ok(())
}

/// Hands out this endpoint's own stream IDs: base parity, ascending by 2,
/// never reused.
#[derive(Debug)]
pub struct StreamIdAllocator {
    next_id: StreamId,
    role: Role,
}

impl StreamIdAllocator {
    pub fn new(role: Role) -> Self {
        Self {
            next_id: role.first_stream_id(),
            role,
        }
    }

    /// The ID the next call to `next` would return.
    pub fn peek(&self) -> StreamId {
        self.next_id
    }

    pub fn next(&mut self) -> Result<StreamId> {
        let id = self.next_id;
        if id > StreamId::MAX - 2 {
            return Err(QmuxError::Internal(
                "stream ID space exhausted".to_string(),
            ));
        }
        self.next_id += 2;
        Ok(id)
    }

    /// Whether `id` is one of our own and was already handed out.
    pub fn already_allocated(&self, id: StreamId) -> bool {
        classify(id, self.role) == Classification::SelfInitiated && id < self.next_id
    }

    pub fn role(&self) -> Role {
        self.role
    }
}
