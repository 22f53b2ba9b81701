// Decision planner: cycle-scoped hysteresis over analyzer output

use crate::types::{DecisionAnalysis, DecisionPlan, DecisionStatus};

/// Configured clamp band applied to the trigger at plan-snapshot time.
#[derive(Debug, Clone, Copy)]
pub struct PlannerSettings {
    pub trigger_min_pct: f64,
    pub trigger_max_pct: f64,
}

/// What `sync_plan` did this tick (used for logging and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanTransition {
    Created,
    Promoted,
    Unchanged,
    Cleared,
}

/// Reconcile the symbol's plan with the latest analysis.
///
/// A new cycle replaces the plan wholesale (or clears it when analysis is
/// WAIT). Within a cycle the only permitted change is a single promotion
/// SIDEWAYS → SETUP; after that the thresholds are frozen until the cycle
/// ends, regardless of what later analyses say.
pub fn sync_plan(
    plan: &mut Option<DecisionPlan>,
    cycle_id: Option<i64>,
    analysis: &DecisionAnalysis,
    live_price: Option<f64>,
    now: i64,
    settings: &PlannerSettings,
) -> PlanTransition {
    let cycle_id = match cycle_id {
        Some(id) => id,
        None => {
            let had = plan.take().is_some();
            return if had {
                PlanTransition::Cleared
            } else {
                PlanTransition::Unchanged
            };
        }
    };

    let same_cycle = plan.as_ref().is_some_and(|p| p.cycle_id == cycle_id);

    if !same_cycle {
        *plan = build_plan(cycle_id, analysis, live_price, now, settings);
        return if plan.is_some() {
            PlanTransition::Created
        } else {
            PlanTransition::Cleared
        };
    }

    let current = plan.as_mut().expect("same_cycle implies plan");
    if current.status == DecisionStatus::Sideways && analysis.status == DecisionStatus::Setup {
        if let Some(promoted) = build_plan(cycle_id, analysis, live_price, now, settings) {
            // Promotion keeps the trigger latch; everything else re-snapshots.
            let has_triggered = current.has_triggered;
            *current = DecisionPlan {
                has_triggered,
                created_at: current.created_at,
                ..promoted
            };
            return PlanTransition::Promoted;
        }
    }
    PlanTransition::Unchanged
}

fn build_plan(
    cycle_id: i64,
    analysis: &DecisionAnalysis,
    live_price: Option<f64>,
    now: i64,
    settings: &PlannerSettings,
) -> Option<DecisionPlan> {
    if !matches!(
        analysis.status,
        DecisionStatus::Setup | DecisionStatus::Sideways
    ) {
        return None;
    }
    let base_price = live_price.filter(|p| p.is_finite() && *p > 0.0)?;
    let (long_above, short_below) = match (analysis.long_above, analysis.short_below) {
        (Some(l), Some(s)) if l.is_finite() && l > 0.0 && s.is_finite() && s > 0.0 => (l, s),
        _ => return None,
    };

    let trigger_pct = analysis
        .trigger_pct
        .clamp(settings.trigger_min_pct, settings.trigger_max_pct);
    // Re-anchor the thresholds if the configured band tightened the trigger.
    let (long_above, short_below) = if trigger_pct == analysis.trigger_pct {
        (long_above, short_below)
    } else {
        (
            base_price * (1.0 + trigger_pct / 100.0),
            base_price * (1.0 - trigger_pct / 100.0),
        )
    };

    Some(DecisionPlan {
        cycle_id,
        status: analysis.status,
        reason: analysis.reason.clone(),
        trigger_pct,
        flow_imbalance: analysis.flow_imbalance,
        flow_samples: analysis.flow_samples,
        base_price,
        long_above,
        short_below,
        created_at: now,
        has_triggered: false,
    })
}
