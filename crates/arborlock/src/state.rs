//! Packed status/mode/generation state word.
//!
//! Every node slot carries one `AtomicU64` packing three orthogonal pieces
//! of state, so that any transition — grant vs. cancel races included — is
//! decided by a single compare-and-swap:
//!
//! ```text
//! [ generation:32 | unused:26 | elevated:1 | mode:2 | status:3 ]
//! ```
//!
//! - `status` is a mutually exclusive progression:
//!   Pending → Granted → Released, or Pending → Cancelled. `Free` marks a
//!   recycled slot; handles never observe it because generation validation
//!   rejects them first.
//! - `mode` is the granted capability (Shared, Upgradeable, Exclusive) and
//!   never changes after creation.
//! - `elevated` is the independent mode bit an upgrade flips: an
//!   Upgradeable node with `elevated` set behaves as Exclusive. It can only
//!   change while the status is Granted.
//! - `generation` is bumped each time the slot is recycled; a handle minted
//!   against an older generation fails validation.

use serde::Serialize;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a lock node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LockStatus {
    /// Queued, not yet granted.
    Pending = 0,
    /// Holding the lock.
    Granted = 1,
    /// Terminal: cancelled while pending.
    Cancelled = 2,
    /// Terminal: released after being granted.
    Released = 3,
    /// Slot is unallocated or recycled. Internal only.
    Free = 4,
}

impl LockStatus {
    #[inline]
    #[must_use]
    pub(crate) const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Pending),
            1 => Some(Self::Granted),
            2 => Some(Self::Cancelled),
            3 => Some(Self::Released),
            4 => Some(Self::Free),
            _ => None,
        }
    }

    /// Lower-case name for tracing fields and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Granted => "granted",
            Self::Cancelled => "cancelled",
            Self::Released => "released",
            Self::Free => "free",
        }
    }

    /// Whether this status is terminal for a request (no further
    /// resolution continuations will fire).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Released)
    }
}

// ---------------------------------------------------------------------------
// Mode
// ---------------------------------------------------------------------------

/// Requested lock mode. `Upgradeable` is Shared-compatible with the right
/// to later become Exclusive without releasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum LockMode {
    Shared = 0,
    Upgradeable = 1,
    Exclusive = 2,
}

impl LockMode {
    #[inline]
    #[must_use]
    pub(crate) const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Shared),
            1 => Some(Self::Upgradeable),
            2 => Some(Self::Exclusive),
            _ => None,
        }
    }

    /// Lower-case name for tracing fields and error messages.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Upgradeable => "upgradeable",
            Self::Exclusive => "exclusive",
        }
    }
}

// ---------------------------------------------------------------------------
// Word encoding
// ---------------------------------------------------------------------------

const STATUS_MASK: u64 = 0b111;
const MODE_SHIFT: u32 = 3;
const MODE_MASK: u64 = 0b11 << MODE_SHIFT;
const ELEVATED_BIT: u64 = 1 << 5;
const GENERATION_SHIFT: u32 = 32;

/// Pack a state word from its parts.
#[inline]
#[must_use]
pub(crate) const fn pack(
    status: LockStatus,
    mode: LockMode,
    elevated: bool,
    generation: u32,
) -> u64 {
    let mut word = status as u64;
    word |= (mode as u64) << MODE_SHIFT;
    if elevated {
        word |= ELEVATED_BIT;
    }
    word | ((generation as u64) << GENERATION_SHIFT)
}

/// Decode the status field. Panics on corrupt bits: a state word that does
/// not decode means memory corruption or a codec bug, and masking that risks
/// a node stuck Pending forever.
#[inline]
#[must_use]
pub(crate) fn status_of(word: u64) -> LockStatus {
    let bits = (word & STATUS_MASK) as u8;
    match LockStatus::from_bits(bits) {
        Some(status) => status,
        None => panic!("corrupt state word: status bits {bits:#b}"),
    }
}

/// Decode the declared mode field (ignoring elevation).
#[inline]
#[must_use]
pub(crate) fn mode_of(word: u64) -> LockMode {
    let bits = ((word & MODE_MASK) >> MODE_SHIFT) as u8;
    match LockMode::from_bits(bits) {
        Some(mode) => mode,
        None => panic!("corrupt state word: mode bits {bits:#b}"),
    }
}

/// Whether the upgrade bit is set.
#[inline]
#[must_use]
pub(crate) const fn elevated_of(word: u64) -> bool {
    word & ELEVATED_BIT != 0
}

/// The mode the node currently behaves as: an elevated Upgradeable node is
/// Exclusive for every compatibility decision.
#[inline]
#[must_use]
pub(crate) fn effective_mode_of(word: u64) -> LockMode {
    if elevated_of(word) {
        LockMode::Exclusive
    } else {
        mode_of(word)
    }
}

/// Decode the slot generation.
#[inline]
#[must_use]
pub(crate) const fn generation_of(word: u64) -> u32 {
    (word >> GENERATION_SHIFT) as u32
}

/// Rewrite only the status field of `word`.
#[inline]
#[must_use]
pub(crate) fn with_status(word: u64, status: LockStatus) -> u64 {
    (word & !STATUS_MASK) | status as u64
}

/// Set or clear only the elevated bit of `word`.
#[inline]
#[must_use]
pub(crate) const fn with_elevated(word: u64, elevated: bool) -> u64 {
    if elevated {
        word | ELEVATED_BIT
    } else {
        word & !ELEVATED_BIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_round_trip() {
        for status in [
            LockStatus::Pending,
            LockStatus::Granted,
            LockStatus::Cancelled,
            LockStatus::Released,
            LockStatus::Free,
        ] {
            for mode in [LockMode::Shared, LockMode::Upgradeable, LockMode::Exclusive] {
                for elevated in [false, true] {
                    for generation in [0_u32, 1, 7, u32::MAX] {
                        let word = pack(status, mode, elevated, generation);
                        assert_eq!(status_of(word), status);
                        assert_eq!(mode_of(word), mode);
                        assert_eq!(elevated_of(word), elevated);
                        assert_eq!(generation_of(word), generation);
                    }
                }
            }
        }
    }

    #[test]
    fn test_effective_mode_tracks_elevation() {
        let word = pack(LockStatus::Granted, LockMode::Upgradeable, false, 3);
        assert_eq!(effective_mode_of(word), LockMode::Upgradeable);
        let raised = with_elevated(word, true);
        assert_eq!(effective_mode_of(raised), LockMode::Exclusive);
        assert_eq!(mode_of(raised), LockMode::Upgradeable, "declared mode survives");
        let lowered = with_elevated(raised, false);
        assert_eq!(effective_mode_of(lowered), LockMode::Upgradeable);
    }

    #[test]
    fn test_with_status_preserves_other_fields() {
        let word = pack(LockStatus::Pending, LockMode::Exclusive, false, 42);
        let granted = with_status(word, LockStatus::Granted);
        assert_eq!(status_of(granted), LockStatus::Granted);
        assert_eq!(mode_of(granted), LockMode::Exclusive);
        assert_eq!(generation_of(granted), 42);
    }

    #[test]
    fn test_generation_occupies_high_bits() {
        let word = pack(LockStatus::Granted, LockMode::Shared, true, u32::MAX);
        assert_eq!(generation_of(word), u32::MAX);
        assert_eq!(status_of(word), LockStatus::Granted);
        assert!(elevated_of(word));
    }
}
