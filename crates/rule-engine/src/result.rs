//! 评估结果
//!
//! [`ConditionResult`] 记录单个条件的评估，同一条件集内的结果通过
//! `evaluation_chain` 从最后评估的条件反向链接到第一个条件。
//! [`RuleResult`] 汇总一次规则评估。结果每次评估新建，不进入缓存。

use std::sync::Arc;
use std::time::Duration;

use crate::context::RuleContext;
use crate::error::EvaluationError;
use crate::models::Rule;

/// 单个条件的评估结果
#[derive(Debug, Clone)]
pub struct ConditionResult {
    pub set_name: String,
    pub set_value: String,
    pub condition_name: String,
    /// 条件在所属条件集中的位置（从 0 开始）
    pub condition_index: usize,
    pub context_type: String,
    pub to_evaluate: String,
    /// 实际参与评估的上下文
    pub data: RuleContext,
    pub evaluator_name: String,
    pub is_success: bool,
    pub failure_message: Option<String>,
    pub exception: Option<EvaluationError>,
    /// 解析评估器耗时
    pub resolve_time: Duration,
    /// 本步骤总耗时（含解析）
    pub step_time: Duration,
    /// 条件集内截至本步骤的累计耗时
    pub cumulative_time: Duration,
    pub tenant_id: String,
    /// 同一条件集内上一个条件的结果，第一个条件为 `None`
    pub evaluation_chain: Option<Arc<ConditionResult>>,
}

impl ConditionResult {
    /// 从本结果开始沿链向前遍历
    pub fn iter_chain(&self) -> ChainIter<'_> {
        ChainIter {
            current: Some(self),
        }
    }

    /// 按评估顺序返回整条链
    pub fn chain_in_order(&self) -> Vec<&ConditionResult> {
        let mut chain: Vec<_> = self.iter_chain().collect();
        chain.reverse();
        chain
    }
}

pub struct ChainIter<'a> {
    current: Option<&'a ConditionResult>,
}

impl<'a> Iterator for ChainIter<'a> {
    type Item = &'a ConditionResult;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        self.current = current.evaluation_chain.as_deref();
        Some(current)
    }
}

/// 规则评估结果
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub rule_name: String,
    /// 评估请求的租户
    pub tenant_id: String,
    /// 规则所属租户
    pub rule_tenant_id: String,
    pub is_success: bool,
    /// 成功时为命中条件集的值，否则为规则的失败值
    pub value: String,
    /// 命中（或最后失败）的条件集的结果链末端
    pub evaluation_chain: Option<Arc<ConditionResult>>,
    /// 每个已评估条件集的末端结果，按评估顺序
    pub evaluation_path: Vec<Arc<ConditionResult>>,
    pub failure_messages: Vec<String>,
    pub exceptions: Vec<EvaluationError>,
    /// 已评估的条件总数
    pub evaluation_count: usize,
    pub elapsed: Duration,
    pub is_disabled: bool,
    /// 调用方串联多次规则评估时的下一个结果
    pub rule_result_chain: Option<Box<RuleResult>>,
}

impl RuleResult {
    /// 规则被禁用时的结果
    pub fn disabled(rule: &Rule, tenant_id: &str) -> Self {
        Self {
            rule_name: rule.name().to_string(),
            tenant_id: tenant_id.to_string(),
            rule_tenant_id: rule.tenant_id().to_string(),
            is_success: false,
            value: rule.failure_value().to_string(),
            evaluation_chain: None,
            evaluation_path: Vec::new(),
            failure_messages: Vec::new(),
            exceptions: Vec::new(),
            evaluation_count: 0,
            elapsed: Duration::ZERO,
            is_disabled: true,
            rule_result_chain: None,
        }
    }

    /// 由最终条件集的结果链汇总
    ///
    /// 只有末端条件成功且链上没有任何异常时才算成功。
    pub fn from_chain(
        rule: &Rule,
        tenant_id: &str,
        chain: Arc<ConditionResult>,
        evaluation_path: Vec<Arc<ConditionResult>>,
        evaluation_count: usize,
        elapsed: Duration,
    ) -> Self {
        let steps = chain.chain_in_order();

        let failure_messages: Vec<String> = steps
            .iter()
            .filter_map(|r| r.failure_message.clone())
            .collect();
        let exceptions: Vec<EvaluationError> =
            steps.iter().filter_map(|r| r.exception.clone()).collect();

        let is_success = chain.is_success && exceptions.is_empty();
        let value = if is_success {
            chain.set_value.clone()
        } else {
            rule.failure_value().to_string()
        };

        Self {
            rule_name: rule.name().to_string(),
            tenant_id: tenant_id.to_string(),
            rule_tenant_id: rule.tenant_id().to_string(),
            is_success,
            value,
            evaluation_chain: Some(chain),
            evaluation_path,
            failure_messages,
            exceptions,
            evaluation_count,
            elapsed,
            is_disabled: false,
            rule_result_chain: None,
        }
    }

    pub fn elapsed_micros(&self) -> u128 {
        self.elapsed.as_micros()
    }

    pub fn elapsed_millis(&self) -> u128 {
        self.elapsed.as_millis()
    }

    /// 在链尾追加下一次规则评估的结果
    pub fn with_next(mut self, next: RuleResult) -> Self {
        let successor = match self.rule_result_chain.take() {
            Some(successor) => (*successor).with_next(next),
            None => next,
        };
        self.rule_result_chain = Some(Box::new(successor));
        self
    }

    /// 从本结果开始遍历规则结果链
    pub fn iter(&self) -> impl Iterator<Item = &RuleResult> {
        std::iter::successors(Some(self), |r| r.rule_result_chain.as_deref())
    }

    /// 命中的条件集名称
    pub fn matched_set(&self) -> Option<&str> {
        self.evaluation_chain
            .as_deref()
            .filter(|_| self.is_success)
            .map(|c| c.set_name.as_str())
    }
}
