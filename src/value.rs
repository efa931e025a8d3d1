//! The dynamically typed payload carried by every [`crate::message::Message`].
//!
//! Transform inputs and outputs are fully dynamic (any -> any).
//! `serde_json::Value` already gives us exactly that: scalars, lists, and
//! string-keyed maps, with the `Object`/`Array`/`Null` variants lining up
//! directly with the join lists, `publish_each` iterables, and
//! mapping-valued transforms the engine needs to support.

/// Re-exported so callers don't need a direct `serde_json` dependency just
/// to build inputs and inspect outputs.
pub type Value = serde_json::Value;
