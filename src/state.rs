//! Pipe lifecycle flags and the transition rules applied to them.
//!
//! The flag word is the whole state machine of one pipe: readiness, the two
//! half-close bits and the two pause bits. Every mutation goes through
//! [`apply`], which reports exactly which edges fired so callers can run each
//! side effect once and decide whether a state notification is owed to the
//! peer.

use std::fmt;

/// Bit set describing the lifecycle of one pipe.
///
/// Starts [`UNSET`](Self::UNSET); the only legal exit from the empty set is
/// gaining [`READY`](Self::READY). Once ready, the remaining flags toggle
/// independently. Half-close flags and `READY` are monotone: they are never
/// removed for the lifetime of one incarnation.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PipeFlags(u8);

impl PipeFlags {
    /// The empty set: a pooled pipe that has not joined a session yet.
    pub const UNSET: Self = Self(0);
    /// Both sides may use the pipe.
    pub const READY: Self = Self(1);
    /// The client side will write no more bytes.
    pub const CLIENT_WRITER_CLOSED: Self = Self(1 << 1);
    /// The server side will write no more bytes.
    pub const SERVER_WRITER_CLOSED: Self = Self(1 << 2);
    /// Raised by the client's reader to throttle the server's writer.
    pub const CLIENT_REQUESTS_PAUSE: Self = Self(1 << 3);
    /// Raised by the server's reader to throttle the client's writer.
    pub const SERVER_REQUESTS_PAUSE: Self = Self(1 << 4);

    /// A pipe that was ready and has closed both directions.
    pub const COMPLETE: Self = Self(Self::READY.0 | Self::CLIENT_WRITER_CLOSED.0 | Self::SERVER_WRITER_CLOSED.0);
    /// The flags a remote state update may clear again.
    pub(crate) const PAUSE_MASK: Self =
        Self(Self::CLIENT_REQUESTS_PAUSE.0 | Self::SERVER_REQUESTS_PAUSE.0);

    const ALL: Self = Self(0b1_1111);
    const NAMES: [(Self, &'static str); 5] = [
        (Self::READY, "READY"),
        (Self::CLIENT_WRITER_CLOSED, "CLIENT_WRITER_CLOSED"),
        (Self::SERVER_WRITER_CLOSED, "SERVER_WRITER_CLOSED"),
        (Self::CLIENT_REQUESTS_PAUSE, "CLIENT_REQUESTS_PAUSE"),
        (Self::SERVER_REQUESTS_PAUSE, "SERVER_REQUESTS_PAUSE"),
    ];

    /// Interpret a wire byte, discarding unknown bits.
    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self { Self(bits & Self::ALL.0) }

    /// Raw byte representation carried by state-update messages.
    #[must_use]
    pub const fn bits(self) -> u8 { self.0 }

    /// Whether no flag is set.
    #[must_use]
    pub const fn is_empty(self) -> bool { self.0 == 0 }

    /// Whether every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }

    /// Whether at least one flag of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool { self.0 & other.0 != 0 }

    /// Flags present in both sets.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self { Self(self.0 & other.0) }

    /// Flags present in either set.
    #[must_use]
    pub const fn union(self, other: Self) -> Self { Self(self.0 | other.0) }

    /// Flags present in `self` but not in `other`.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self { Self(self.0 & !other.0) }

    /// Whether the pipe was ready and both directions have closed.
    #[must_use]
    pub const fn is_complete(self) -> bool { self.contains(Self::COMPLETE) }
}

impl fmt::Debug for PipeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("UNSET");
        }
        let mut first = true;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Display for PipeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

impl std::ops::BitOr for PipeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self { self.union(rhs) }
}

/// Which end of the connection this peer is.
///
/// The flag set is shared verbatim by both peers; the role decides which
/// concrete flag maps to which local direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Derive the role from the session's `is_server_side` answer.
    #[must_use]
    pub const fn from_server_side(is_server: bool) -> Self {
        if is_server { Role::Server } else { Role::Client }
    }

    /// The half-close flag this side sets when its writer finishes.
    ///
    /// Arriving from the peer, the same flag means "I will not read from you
    /// any more" and forces the local writer closed.
    #[must_use]
    pub const fn writer_closed_flag(self) -> PipeFlags {
        match self {
            Role::Client => PipeFlags::CLIENT_WRITER_CLOSED,
            Role::Server => PipeFlags::SERVER_WRITER_CLOSED,
        }
    }

    /// The half-close flag meaning the peer stopped writing to this side.
    ///
    /// The local reader also raises it on notifying completion ("I will not
    /// read any more").
    #[must_use]
    pub const fn reader_closed_flag(self) -> PipeFlags {
        match self {
            Role::Client => PipeFlags::SERVER_WRITER_CLOSED,
            Role::Server => PipeFlags::CLIENT_WRITER_CLOSED,
        }
    }

    /// The pause flag this side's reader raises to throttle the peer.
    #[must_use]
    pub const fn pause_raised_flag(self) -> PipeFlags {
        match self {
            Role::Client => PipeFlags::CLIENT_REQUESTS_PAUSE,
            Role::Server => PipeFlags::SERVER_REQUESTS_PAUSE,
        }
    }

    /// The peer-raised pause flag that gates this side's flush.
    #[must_use]
    pub const fn pause_observed_flag(self) -> PipeFlags {
        match self {
            Role::Client => PipeFlags::SERVER_REQUESTS_PAUSE,
            Role::Server => PipeFlags::CLIENT_REQUESTS_PAUSE,
        }
    }
}

/// Edges fired by a single [`apply`] call.
///
/// Each field is `true` at most once per pipe incarnation for the monotone
/// flags, which is what makes "the side effect ran exactly once" checkable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Transitions {
    /// At least one flag was added or removed.
    pub changed: bool,
    /// The pipe left `UNSET` and is now usable.
    pub became_ready: bool,
    /// This side's write direction just became pointless; stop writing.
    pub writer_closed: bool,
    /// The peer just stopped writing; complete the local reader.
    pub reader_closed: bool,
}

/// Apply a flag change to `flags`, reporting the edges that fired.
///
/// Adding an already-set flag or removing an already-absent one is a no-op
/// and reports `changed == false`; ordinary state races therefore never
/// fault. A `changed` result is the caller's cue to send a state
/// notification to the peer.
pub(crate) fn apply(flags: &mut PipeFlags, change: PipeFlags, remove: bool, role: Role) -> Transitions {
    if remove {
        let removed = flags.intersection(change);
        *flags = flags.difference(change);
        return Transitions {
            changed: !removed.is_empty(),
            ..Transitions::default()
        };
    }

    let added = change.difference(*flags);
    *flags = flags.union(change);
    Transitions {
        changed: !added.is_empty(),
        became_ready: added.contains(PipeFlags::READY),
        writer_closed: added.contains(role.writer_closed_flag()),
        reader_closed: added.contains(role.reader_closed_flag()),
    }
}
