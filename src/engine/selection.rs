//! Weighted action selection.
//!
//! Each slot of a burst draws one category from an explicit
//! `{category: weight}` table built from [`ActionSettings`]. An empty table
//! yields [`ActionCategory::FALLBACK`], so a plan always has one action per
//! slot.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::time::Duration;

use crate::config::ActionSettings;
use crate::models::{ActionCategory, BurstPlan, PlannedAction};

/// What the table depends on besides configuration.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext {
    pub locked: bool,
    /// Text entry needs a live typing target.
    pub companion_active: bool,
}

/// Eligible categories and their weights for one slot. `slot` is the 1-based,
/// session-wide selection counter used by the every-Nth gates.
pub fn weight_table(
    settings: &ActionSettings,
    context: SelectionContext,
    slot: u64,
) -> Vec<(ActionCategory, u32)> {
    ActionCategory::ALL
        .into_iter()
        .filter_map(|category| {
            let entry = settings.get(category);
            if !entry.enabled {
                return None;
            }
            if category == ActionCategory::TextEntry && (context.locked || !context.companion_active)
            {
                return None;
            }
            if let Some(every) = entry.every_nth {
                if every == 0 || slot % u64::from(every) != 0 {
                    return None;
                }
            }
            let weight = if context.locked {
                entry.locked_weight
            } else {
                entry.weight
            };
            (weight > 0).then_some((category, weight))
        })
        .collect()
}

pub fn choose<R: Rng + ?Sized>(table: &[(ActionCategory, u32)], rng: &mut R) -> PlannedAction {
    let Ok(index) = WeightedIndex::new(table.iter().map(|(_, weight)| *weight)) else {
        return PlannedAction {
            category: ActionCategory::FALLBACK,
            fallback: true,
        };
    };
    PlannedAction {
        category: table[index.sample(rng)].0,
        fallback: false,
    }
}

/// Builds the full plan for one cycle. `next_slot` hands out the session-wide
/// selection counter, one value per slot.
pub fn plan_burst<R, F>(
    settings: &ActionSettings,
    context: SelectionContext,
    sleep_interval: Duration,
    burst_size: u32,
    mode_epoch: u64,
    mut next_slot: F,
    rng: &mut R,
) -> BurstPlan
where
    R: Rng + ?Sized,
    F: FnMut() -> u64,
{
    let burst_size = burst_size.max(1);
    let actions = (0..burst_size)
        .map(|_| {
            let table = weight_table(settings, context, next_slot());
            choose(&table, rng)
        })
        .collect();

    BurstPlan {
        sleep_interval,
        burst_size,
        actions,
        locked: context.locked,
        mode_epoch,
    }
}
