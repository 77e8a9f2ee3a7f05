//! Parses a line of player input into an `EncounterAction`.
//!
//! Not part of the wire protocol -- purely a convenience for driving the
//! demo from a terminal. Commands:
//!
//! ```text
//! add <id> <name> <initiative> <max_hp> [npc]
//! remove <id>
//! damage <id> <amount>
//! heal <id> <amount>
//! initiative <id> <value>
//! start
//! next
//! ```

use collab_testkit::EncounterAction;

pub fn parse(line: &str) -> Result<Option<EncounterAction>, String> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some((command, rest)) = tokens.split_first() else {
        return Ok(None);
    };

    match *command {
        "add" => {
            let [id, name, initiative, max_hp] = rest.get(0..4).ok_or("usage: add <id> <name> <initiative> <max_hp> [npc]")?
            else {
                return Err("usage: add <id> <name> <initiative> <max_hp> [npc]".to_owned());
            };
            let initiative: i32 = initiative.parse().map_err(|_| "initiative must be an integer".to_owned())?;
            let max_hp: i32 = max_hp.parse().map_err(|_| "max_hp must be an integer".to_owned())?;
            let is_npc = rest.get(4).is_some_and(|flag| *flag == "npc");
            Ok(Some(EncounterAction::AddCombatant {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
                initiative,
                max_hp,
                is_npc,
            }))
        }
        "remove" => {
            let id = rest.first().ok_or("usage: remove <id>")?;
            Ok(Some(EncounterAction::RemoveCombatant { id: (*id).to_owned() }))
        }
        "damage" => {
            let [id, amount] = rest.get(0..2).ok_or("usage: damage <id> <amount>")? else {
                return Err("usage: damage <id> <amount>".to_owned());
            };
            let amount: i32 = amount.parse().map_err(|_| "amount must be an integer".to_owned())?;
            Ok(Some(EncounterAction::ApplyDamage { id: (*id).to_owned(), amount }))
        }
        "heal" => {
            let [id, amount] = rest.get(0..2).ok_or("usage: heal <id> <amount>")? else {
                return Err("usage: heal <id> <amount>".to_owned());
            };
            let amount: i32 = amount.parse().map_err(|_| "amount must be an integer".to_owned())?;
            Ok(Some(EncounterAction::ApplyHealing { id: (*id).to_owned(), amount }))
        }
        "initiative" => {
            let [id, value] = rest.get(0..2).ok_or("usage: initiative <id> <value>")? else {
                return Err("usage: initiative <id> <value>".to_owned());
            };
            let initiative: i32 = value.parse().map_err(|_| "value must be an integer".to_owned())?;
            Ok(Some(EncounterAction::SetInitiative { id: (*id).to_owned(), initiative }))
        }
        "start" => Ok(Some(EncounterAction::StartEncounter)),
        "next" => Ok(Some(EncounterAction::AdvanceTurn)),
        other => Err(format!("unrecognized command '{other}' (try add/remove/damage/heal/initiative/start/next)")),
    }
}
