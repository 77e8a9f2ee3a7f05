//! collab-testkit: a realistic sample embedder for the collaboration core.
//!
//! `EncounterState` is a tabletop initiative tracker: combatants joining and
//! leaving, taking damage and healing, turn order advancing round by round.
//! It exists purely to exercise `collab-engine`/`collab-client`/`collab-host`
//! against a non-trivial reducer with real validation and per-client
//! redaction -- the core itself has no idea this domain exists.

pub mod encounter;

pub use encounter::{
    filter_for_client, initial_state, reduce, validate, Combatant, EncounterAction, EncounterContext,
    EncounterEvent, EncounterState, DM_CLIENT_ID,
};
