//! Output formatting

use anyhow::Result;
use serde::Serialize;
use shardline_routing::ShardPlan;

/// One plan entry as printed.
#[derive(Debug, Serialize)]
pub struct PlanRow {
    pub position: usize,
    pub shard_key: String,
    pub account_id: String,
    pub region: Option<String>,
    pub strategy: String,
    pub source: String,
    pub score: Option<f64>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PlanOutput {
    pub site_id: String,
    pub shards: Vec<PlanRow>,
    pub warnings: Vec<String>,
}

impl From<&ShardPlan> for PlanOutput {
    fn from(plan: &ShardPlan) -> Self {
        let shards = plan
            .shards
            .iter()
            .enumerate()
            .map(|(position, shard)| PlanRow {
                position,
                shard_key: shard.shard_key().to_string(),
                account_id: shard.account_id().to_string(),
                region: shard.candidate.region.as_ref().map(|r| r.to_string()),
                strategy: shard.strategy.to_string(),
                source: shard.source.to_string(),
                score: shard.score,
                warnings: shard.warnings.clone(),
            })
            .collect();

        Self {
            site_id: plan.site_id.clone(),
            shards,
            warnings: plan.warnings.clone(),
        }
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn print_plan(plan: &PlanOutput) {
    println!("Plan for {}", plan.site_id);
    for row in &plan.shards {
        let role = if row.position == 0 { "primary" } else { "fallback" };
        let score = row
            .score
            .map(|s| format!("{s:.4}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:>2}. {:<20} {:<34} {:<10} {:<16} {:>8}  {}",
            row.position,
            row.shard_key,
            row.account_id,
            row.region.as_deref().unwrap_or("-"),
            row.strategy,
            score,
            role
        );
    }
    for warning in &plan.warnings {
        println!("  warning: {warning}");
    }
}
