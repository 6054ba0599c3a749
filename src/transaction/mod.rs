//! RFC 3261 transaction layer: the four state machines, their timers and
//! the endpoint that owns the transaction table.

use key::TransactionKey;
use rand::Rng;
use std::fmt;
use std::time::Duration;

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
#[allow(clippy::module_inception)]
pub mod transaction;

#[cfg(test)]
mod tests;

/// Via branch prefix required by RFC 3261 on all generated requests.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

/// A fresh Via branch: magic cookie plus 16 hex characters.
pub fn make_branch() -> String {
    let random: u64 = rand::rng().random();
    format!("{MAGIC_COOKIE}{random:016x}")
}

/// A fresh From/To tag: 8 hex characters.
pub fn make_tag() -> String {
    let random: u32 = rand::rng().random();
    format!("{random:08x}")
}

/// A fresh Call-ID: 32 hex characters followed by `@suffix`.
pub fn make_call_id(suffix: Option<&str>) -> String {
    let a: u64 = rand::rng().random();
    let b: u64 = rand::rng().random();
    format!("{a:016x}{b:016x}@{}", suffix.unwrap_or("sipkit"))
}

/// 16 hex characters, used for Digest cnonce values.
pub fn make_cnonce() -> String {
    let random: u64 = rand::rng().random();
    format!("{random:016x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl TransactionType {
    pub fn is_client(&self) -> bool {
        matches!(self, TransactionType::ClientInvite | TransactionType::ClientNonInvite)
    }

    pub fn is_server(&self) -> bool {
        !self.is_client()
    }
}

/// Transaction states across all four machines. `Accepted` exists only
/// for INVITE transactions (RFC 6026), `Confirmed` only for the INVITE
/// server machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

/// A scheduled transaction timer. Retransmission timers (A, E, G) carry
/// their current interval so expiry can double it up to T2.
#[derive(Debug, Clone)]
pub enum TransactionTimer {
    TimerA(TransactionKey, Duration),
    TimerB(TransactionKey),
    TimerD(TransactionKey),
    TimerE(TransactionKey, Duration),
    TimerF(TransactionKey),
    TimerG(TransactionKey, Duration),
    TimerH(TransactionKey),
    TimerI(TransactionKey),
    TimerJ(TransactionKey),
    TimerK(TransactionKey),
    TimerL(TransactionKey),
    TimerM(TransactionKey),
}

impl TransactionTimer {
    pub fn key(&self) -> &TransactionKey {
        match self {
            TransactionTimer::TimerA(key, _)
            | TransactionTimer::TimerB(key)
            | TransactionTimer::TimerD(key)
            | TransactionTimer::TimerE(key, _)
            | TransactionTimer::TimerF(key)
            | TransactionTimer::TimerG(key, _)
            | TransactionTimer::TimerH(key)
            | TransactionTimer::TimerI(key)
            | TransactionTimer::TimerJ(key)
            | TransactionTimer::TimerK(key)
            | TransactionTimer::TimerL(key)
            | TransactionTimer::TimerM(key) => key,
        }
    }

    fn letter(&self) -> char {
        match self {
            TransactionTimer::TimerA(_, _) => 'A',
            TransactionTimer::TimerB(_) => 'B',
            TransactionTimer::TimerD(_) => 'D',
            TransactionTimer::TimerE(_, _) => 'E',
            TransactionTimer::TimerF(_) => 'F',
            TransactionTimer::TimerG(_, _) => 'G',
            TransactionTimer::TimerH(_) => 'H',
            TransactionTimer::TimerI(_) => 'I',
            TransactionTimer::TimerJ(_) => 'J',
            TransactionTimer::TimerK(_) => 'K',
            TransactionTimer::TimerL(_) => 'L',
            TransactionTimer::TimerM(_) => 'M',
        }
    }
}

impl fmt::Display for TransactionTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timer {} ({})", self.letter(), self.key())
    }
}
