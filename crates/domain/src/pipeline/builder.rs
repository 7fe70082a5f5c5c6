use crate::chain::entity::ChainRule;
use crate::chain::error::ChainError;
use crate::chain::store::Chain;
use crate::common::entity::{ChainName, RuleAction};
use crate::compiler::field::{CompiledField, FieldCompiler, MatchField};

use super::entity::{Bank, PipelinePlan, PlannedStage, StageKind, StageTable};

/// Orders compiled field stages and lays them out in a bank.
#[derive(Debug, Clone, Copy)]
pub struct PipelineBuilder {
    compiler: FieldCompiler,
    max_rules: u32,
}

impl PipelineBuilder {
    pub fn new(max_rules: u32) -> Self {
        Self {
            compiler: FieldCompiler::new(max_rules),
            max_rules,
        }
    }

    /// Compile `chain` and plan its stages in `bank`.
    pub fn build<F>(&self, chain: &Chain, bank: Bank, resolve: F) -> Result<PipelinePlan, ChainError>
    where
        F: Fn(&str) -> Option<u32>,
    {
        let fields = self.compiler.compile_all(chain.name(), chain.rules(), resolve)?;
        Ok(self.assemble(
            chain.name(),
            bank,
            chain.default_action(),
            chain.rules(),
            fields,
        ))
    }

    /// Lay out already compiled fields. An empty rule list yields no
    /// stages at all.
    pub fn assemble(
        &self,
        chain: ChainName,
        bank: Bank,
        default_action: RuleAction,
        rules: &[ChainRule],
        fields: Vec<CompiledField>,
    ) -> PipelinePlan {
        let mut plan = PipelinePlan {
            chain,
            bank,
            default_action,
            rule_count: rules.len(),
            max_rules: self.max_rules,
            stages: Vec::new(),
        };
        if rules.is_empty() {
            return plan;
        }

        let base = bank.base(chain);
        let mut tables: Vec<StageTable> = Self::order(fields)
            .into_iter()
            .map(StageTable::Field)
            .collect();
        tables.push(StageTable::BitScan);
        tables.push(StageTable::Action(rules.iter().map(|r| r.action).collect()));

        let indices: Vec<u16> = tables.iter().map(|t| base + t.kind().offset()).collect();
        plan.stages = tables
            .into_iter()
            .enumerate()
            .map(|(i, table)| PlannedStage {
                index: indices[i],
                next: indices.get(i + 1).copied(),
                table,
            })
            .collect();
        plan
    }

    /// Two passes in field priority order: early-break fields first,
    /// then the rest.
    pub fn order(fields: Vec<CompiledField>) -> Vec<CompiledField> {
        let mut fields = fields;
        fields.sort_by_key(|c| (!c.early_break, priority(c.field)));
        fields
    }
}

fn priority(field: MatchField) -> usize {
    MatchField::PRIORITY
        .iter()
        .position(|f| *f == field)
        .unwrap_or(MatchField::PRIORITY.len())
}

/// Stage kinds in traversal order, for logs and summaries.
pub fn describe(plan: &PipelinePlan) -> String {
    plan.stages
        .iter()
        .map(|s| format!("{}@{}", s.kind(), s.index))
        .collect::<Vec<_>>()
        .join(" -> ")
}
