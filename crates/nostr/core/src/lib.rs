//! Nostr protocol primitives: canonical event codec, signing and filters.

pub mod filter;
pub mod nip01;
mod signer;
mod tag_parsing;

pub use filter::{Filter, filters_match};
pub use nip01::{
    Event, EventTemplate, KIND_CLIENT_AUTH, KIND_SHORT_TEXT_NOTE, KindClassification, Nip01Error,
    UnsignedEvent, classify_kind, finalize_event, generate_secret_key, get_event_hash,
    get_public_key, get_public_key_hex, is_ephemeral_kind, is_replaceable_kind, serialize_event,
    unix_now, validate_event, verify_event,
};
pub use signer::{Keys, Signer};
