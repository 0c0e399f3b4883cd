//! Routing layer (Module F, §4.F): point-to-point adjacency bring-up and the
//! packet formats it speaks. Area/Level-1 routing decision and forwarding are
//! out of scope (§1 non-goals) — this module only brings a single adjacency
//! up and passes NSP-bound payloads through it.

pub mod packet;
pub mod ptp;
