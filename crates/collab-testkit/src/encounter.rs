//! The `EncounterState` reducer: a tabletop session's initiative order and
//! combatant health.

use collab_engine::ReducerError;
use collab_protocol::Event;
use serde::{Deserialize, Serialize};

/// The reserved client id of the game master's client, the only recipient
/// DM-only events are delivered to.
pub const DM_CLIENT_ID: &str = "dm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Combatant {
    pub id: String,
    pub name: String,
    pub initiative: i32,
    pub max_hp: i32,
    pub hp: i32,
    pub is_npc: bool,
}

/// The derived state an `EncounterState` reducer folds `EncounterEvent`s
/// into. Turn order is always the combatants sorted by initiative
/// descending, ties broken by id so it's deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterState {
    pub round: u32,
    pub active_combatant: Option<String>,
    pub combatants: Vec<Combatant>,
}

/// The domain payload (`P`) of an `EncounterEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EncounterAction {
    AddCombatant {
        id: String,
        name: String,
        initiative: i32,
        max_hp: i32,
        is_npc: bool,
    },
    RemoveCombatant {
        id: String,
    },
    ApplyDamage {
        id: String,
        amount: i32,
    },
    ApplyHealing {
        id: String,
        amount: i32,
    },
    SetInitiative {
        id: String,
        initiative: i32,
    },
    StartEncounter,
    AdvanceTurn,
}

/// The domain context (`C`) of an `EncounterEvent`: whether this event is a
/// DM-only ruling that `filter_for_client` should hide from players.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterContext {
    pub dm_only: bool,
}

pub type EncounterEvent = Event<EncounterAction, EncounterContext>;

pub fn initial_state() -> EncounterState {
    EncounterState::default()
}

/// The reducer: `Fn(&EncounterState, &EncounterEvent) -> Result<EncounterState, ReducerError>`.
pub fn reduce(state: &EncounterState, event: &EncounterEvent) -> Result<EncounterState, ReducerError> {
    let mut next = state.clone();
    match &event.payload {
        EncounterAction::AddCombatant { id, name, initiative, max_hp, is_npc } => {
            if next.combatants.iter().any(|c| &c.id == id) {
                return Err(ReducerError::msg(format!("combatant '{id}' already exists")));
            }
            if *max_hp <= 0 {
                return Err(ReducerError::msg("max_hp must be positive"));
            }
            next.combatants.push(Combatant {
                id: id.clone(),
                name: name.clone(),
                initiative: *initiative,
                max_hp: *max_hp,
                hp: *max_hp,
                is_npc: *is_npc,
            });
            resort(&mut next);
        }
        EncounterAction::RemoveCombatant { id } => {
            let before = next.combatants.len();
            next.combatants.retain(|c| &c.id != id);
            if next.combatants.len() == before {
                return Err(ReducerError::msg(format!("unknown combatant '{id}'")));
            }
            if next.active_combatant.as_deref() == Some(id.as_str()) {
                next.active_combatant = next.combatants.first().map(|c| c.id.clone());
            }
        }
        EncounterAction::ApplyDamage { id, amount } => {
            if *amount < 0 {
                return Err(ReducerError::msg("damage amount must be non-negative"));
            }
            let combatant = find_mut(&mut next, id)?;
            combatant.hp = (combatant.hp - amount).max(0);
        }
        EncounterAction::ApplyHealing { id, amount } => {
            if *amount < 0 {
                return Err(ReducerError::msg("healing amount must be non-negative"));
            }
            let combatant = find_mut(&mut next, id)?;
            combatant.hp = (combatant.hp + amount).min(combatant.max_hp);
        }
        EncounterAction::SetInitiative { id, initiative } => {
            find_mut(&mut next, id)?.initiative = *initiative;
            resort(&mut next);
        }
        EncounterAction::StartEncounter => {
            next.round = 1;
            resort(&mut next);
            next.active_combatant = next.combatants.first().map(|c| c.id.clone());
        }
        EncounterAction::AdvanceTurn => advance_turn(&mut next),
    }
    Ok(next)
}

fn find_mut<'a>(state: &'a mut EncounterState, id: &str) -> Result<&'a mut Combatant, ReducerError> {
    state
        .combatants
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| ReducerError::msg(format!("unknown combatant '{id}'")))
}

/// Sorts combatants into turn order: initiative descending, id ascending to
/// break ties deterministically.
fn resort(state: &mut EncounterState) {
    state.combatants.sort_by(|a, b| b.initiative.cmp(&a.initiative).then_with(|| a.id.cmp(&b.id)));
}

fn advance_turn(state: &mut EncounterState) {
    if state.combatants.is_empty() {
        state.active_combatant = None;
        return;
    }
    let current_index = state
        .active_combatant
        .as_ref()
        .and_then(|id| state.combatants.iter().position(|c| &c.id == id));
    let next_index = match current_index {
        Some(i) if i + 1 < state.combatants.len() => i + 1,
        _ => {
            state.round += 1;
            0
        }
    };
    state.active_combatant = Some(state.combatants[next_index].id.clone());
}

/// Host-side validation gate: damage/healing amounts must be non-negative.
/// (Redundant with the reducer's own check -- this lets the host reject a
/// bad proposal before it ever reaches the log, rather than relying on the
/// reducer error path, which the spec treats as a harder failure.)
pub fn validate(event: &EncounterEvent, _client_id: &str) -> bool {
    match &event.payload {
        EncounterAction::ApplyDamage { amount, .. } | EncounterAction::ApplyHealing { amount, .. } => *amount >= 0,
        _ => true,
    }
}

/// Host-side per-recipient projection: events marked `dm_only` in their
/// context are delivered only to [`DM_CLIENT_ID`].
pub fn filter_for_client(event: &EncounterEvent, client_id: &str) -> Option<EncounterEvent> {
    let dm_only = event.context.as_ref().is_some_and(|c| c.dm_only);
    if dm_only && client_id != DM_CLIENT_ID {
        None
    } else {
        Some(event.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_protocol::Source;

    fn action_event(id: &str, ts: i64, action: EncounterAction) -> EncounterEvent {
        Event {
            id: id.to_owned(),
            timestamp: ts,
            source: Source::client("dm"),
            payload: action,
            context: None,
        }
    }

    fn dm_only_event(id: &str, ts: i64, action: EncounterAction) -> EncounterEvent {
        Event {
            context: Some(EncounterContext { dm_only: true }),
            ..action_event(id, ts, action)
        }
    }

    #[test]
    fn adding_combatants_sorts_by_initiative_descending() {
        let state = initial_state();
        let state = reduce(
            &state,
            &action_event("a", 1, EncounterAction::AddCombatant { id: "goblin".into(), name: "Goblin".into(), initiative: 12, max_hp: 7, is_npc: true }),
        )
        .unwrap();
        let state = reduce(
            &state,
            &action_event("b", 2, EncounterAction::AddCombatant { id: "aria".into(), name: "Aria".into(), initiative: 18, max_hp: 24, is_npc: false }),
        )
        .unwrap();
        let ids: Vec<&str> = state.combatants.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["aria", "goblin"]);
    }

    #[test]
    fn duplicate_combatant_id_is_rejected() {
        let state = initial_state();
        let state = reduce(
            &state,
            &action_event("a", 1, EncounterAction::AddCombatant { id: "goblin".into(), name: "Goblin".into(), initiative: 12, max_hp: 7, is_npc: true }),
        )
        .unwrap();
        let err = reduce(
            &state,
            &action_event("b", 2, EncounterAction::AddCombatant { id: "goblin".into(), name: "Goblin 2".into(), initiative: 9, max_hp: 5, is_npc: true }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn damage_clamps_at_zero_and_healing_clamps_at_max() {
        let state = initial_state();
        let state = reduce(
            &state,
            &action_event("a", 1, EncounterAction::AddCombatant { id: "aria".into(), name: "Aria".into(), initiative: 18, max_hp: 10, is_npc: false }),
        )
        .unwrap();

        let state = reduce(&state, &action_event("b", 2, EncounterAction::ApplyDamage { id: "aria".into(), amount: 999 })).unwrap();
        assert_eq!(state.combatants[0].hp, 0);

        let state = reduce(&state, &action_event("c", 3, EncounterAction::ApplyHealing { id: "aria".into(), amount: 999 })).unwrap();
        assert_eq!(state.combatants[0].hp, 10);
    }

    #[test]
    fn damage_to_unknown_combatant_is_rejected() {
        let state = initial_state();
        let err = reduce(&state, &action_event("a", 1, EncounterAction::ApplyDamage { id: "ghost".into(), amount: 1 }));
        assert!(err.is_err());
    }

    #[test]
    fn advance_turn_wraps_and_increments_round() {
        let state = initial_state();
        let state = reduce(
            &state,
            &action_event("a", 1, EncounterAction::AddCombatant { id: "aria".into(), name: "Aria".into(), initiative: 18, max_hp: 10, is_npc: false }),
        )
        .unwrap();
        let state = reduce(
            &state,
            &action_event("b", 2, EncounterAction::AddCombatant { id: "goblin".into(), name: "Goblin".into(), initiative: 12, max_hp: 7, is_npc: true }),
        )
        .unwrap();
        let state = reduce(&state, &action_event("c", 3, EncounterAction::StartEncounter)).unwrap();
        assert_eq!(state.round, 1);
        assert_eq!(state.active_combatant.as_deref(), Some("aria"));

        let state = reduce(&state, &action_event("d", 4, EncounterAction::AdvanceTurn)).unwrap();
        assert_eq!(state.active_combatant.as_deref(), Some("goblin"));
        assert_eq!(state.round, 1);

        let state = reduce(&state, &action_event("e", 5, EncounterAction::AdvanceTurn)).unwrap();
        assert_eq!(state.active_combatant.as_deref(), Some("aria"));
        assert_eq!(state.round, 2);
    }

    #[test]
    fn validate_rejects_negative_damage_and_healing() {
        let damage = action_event("a", 1, EncounterAction::ApplyDamage { id: "x".into(), amount: -1 });
        assert!(!validate(&damage, "alice"));
        let heal = action_event("b", 2, EncounterAction::ApplyHealing { id: "x".into(), amount: -1 });
        assert!(!validate(&heal, "alice"));
        let add = action_event("c", 3, EncounterAction::AdvanceTurn);
        assert!(validate(&add, "alice"));
    }

    #[test]
    fn filter_for_client_hides_dm_only_events_from_players() {
        let event = dm_only_event("a", 1, EncounterAction::ApplyDamage { id: "goblin".into(), amount: 3 });
        assert!(filter_for_client(&event, "player-1").is_none());
        assert!(filter_for_client(&event, DM_CLIENT_ID).is_some());
    }

    #[test]
    fn filter_for_client_passes_public_events_to_everyone() {
        let event = action_event("a", 1, EncounterAction::AdvanceTurn);
        assert!(filter_for_client(&event, "player-1").is_some());
        assert!(filter_for_client(&event, DM_CLIENT_ID).is_some());
    }
}
