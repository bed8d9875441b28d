//! # Grimoire Spellbook
//!
//! The spell data model (one YAML file per spell) and the discovery
//! component that keeps a live `name → Spell` map in sync with the spell
//! directory.
//!
//! Spells are validated at parse time: transports and auth kinds are sum
//! types, so downstream code never branches on stringly-typed kinds, and a
//! file that fails validation never reaches the resolver.

mod discovery;
mod error;
mod spell;

pub use discovery::{SpellDiscovery, SpellEvent, DISCOVERY_DEBOUNCE};
pub use error::{Result, SpellError};
pub use spell::{
    is_valid_spell_name, spell_file_name, AuthConfig, ServerConfig, Spell, MIN_KEYWORDS,
    SPELL_FILE_SUFFIX,
};
