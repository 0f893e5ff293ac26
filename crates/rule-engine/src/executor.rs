//! 规则执行器
//!
//! 条件集之间做短路 OR，条件集内部做短路 AND：
//! - 某个条件失败（或出现故障）时，同一条件集内后续条件不再评估
//! - 某个条件集成功（或末端带有故障）时，后续条件集不再评估
//!
//! 配置类错误在任何评估开始前返回；评估器解析失败、评估器 panic、取消等
//! 评估期故障被记录到 [`ConditionResult`] 中，不会中断调用。

use futures::FutureExt;
use rules_shared::observability::metrics::{record_condition_evaluation, record_rule_evaluation};
use serde_json::Value;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::context::{RuleContext, select_context};
use crate::error::{EvaluationError, Result, RuleError};
use crate::evaluator::EvaluationOutcome;
use crate::events::{EventAggregator, EventDescriptor, EventDetails, SenderKind};
use crate::models::{ConditionSet, DynCondition, Rule};
use crate::resolver::EvaluatorResolver;
use crate::result::{ConditionResult, RuleResult};

/// 规则执行器
pub struct RuleExecutor<'a> {
    resolver: &'a EvaluatorResolver,
    events: &'a EventAggregator,
}

impl<'a> RuleExecutor<'a> {
    pub fn new(resolver: &'a EvaluatorResolver, events: &'a EventAggregator) -> Self {
        Self { resolver, events }
    }

    /// 执行规则评估
    #[instrument(skip_all, fields(rule = rule.name(), tenant = tenant_id))]
    pub async fn execute(
        &self,
        rule: &Rule,
        contexts: &[RuleContext],
        tenant_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RuleResult> {
        let start = Instant::now();

        if !rule.is_enabled() {
            debug!("规则已禁用");
            record_rule_evaluation(rule.name(), "disabled", 0.0);
            return Ok(RuleResult::disabled(rule, tenant_id));
        }

        let selections = Self::select_contexts(rule, contexts)?;

        let mut evaluation_path = Vec::with_capacity(rule.condition_sets().len());
        let mut evaluation_count = 0usize;

        for (set, set_contexts) in rule.condition_sets().iter().zip(&selections) {
            let terminal = self
                .evaluate_set(set, set_contexts, tenant_id, cancel, &mut evaluation_count)
                .await
                .ok_or_else(|| RuleError::MissingConditions {
                    set_name: set.name().to_string(),
                })?;

            let stop = terminal.is_success || terminal.exception.is_some();
            evaluation_path.push(terminal);

            if stop {
                break;
            }
        }

        let terminal = evaluation_path
            .last()
            .cloned()
            .ok_or_else(|| RuleError::MissingConditionSets {
                rule_name: rule.name().to_string(),
            })?;

        let result = RuleResult::from_chain(
            rule,
            tenant_id,
            terminal,
            evaluation_path,
            evaluation_count,
            start.elapsed(),
        );

        info!(
            success = result.is_success,
            value = %result.value,
            evaluations = result.evaluation_count,
            elapsed_us = result.elapsed_micros() as u64,
            "规则评估完成"
        );
        record_rule_evaluation(
            rule.name(),
            if result.is_success { "success" } else { "failure" },
            result.elapsed.as_secs_f64(),
        );

        if let Some(descriptor) = rule.event() {
            self.publish_rule_event(descriptor, rule, &result, contexts, cancel)
                .await;
        }

        Ok(result)
    }

    /// 校验上下文并为每个条件选定上下文
    ///
    /// 所有配置类错误都在评估开始前返回。
    fn select_contexts<'c>(
        rule: &Rule,
        contexts: &'c [RuleContext],
    ) -> Result<Vec<Vec<&'c RuleContext>>> {
        if contexts.is_empty() {
            return Err(RuleError::MissingRuleContexts(format!(
                "规则 '{}' 未提供任何上下文",
                rule.name()
            )));
        }

        let unmatched: Vec<String> = contexts
            .iter()
            .filter_map(RuleContext::condition_name)
            .filter(|name| !rule.contains_condition(name))
            .map(str::to_string)
            .collect();
        if !unmatched.is_empty() {
            return Err(RuleError::UnmatchedContexts {
                rule_name: rule.name().to_string(),
                condition_names: unmatched,
            });
        }

        if rule.condition_sets().is_empty() {
            return Err(RuleError::MissingConditionSets {
                rule_name: rule.name().to_string(),
            });
        }

        rule.condition_sets()
            .iter()
            .map(|set| -> Result<Vec<&'c RuleContext>> {
                if set.is_empty() {
                    return Err(RuleError::MissingConditions {
                        set_name: set.name().to_string(),
                    });
                }

                set.conditions()
                    .iter()
                    .map(|condition| {
                        select_context(contexts, condition.name(), condition.context_type())
                            .ok_or_else(|| {
                                RuleError::MissingRuleContexts(format!(
                                    "条件 '{}' 需要类型为 {} 的上下文",
                                    condition.name(),
                                    condition.context_type()
                                ))
                            })
                    })
                    .collect()
            })
            .collect()
    }

    /// 评估条件集，返回结果链末端
    async fn evaluate_set(
        &self,
        set: &ConditionSet,
        contexts: &[&RuleContext],
        tenant_id: &str,
        cancel: &CancellationToken,
        evaluation_count: &mut usize,
    ) -> Option<Arc<ConditionResult>> {
        let set_start = Instant::now();
        let mut previous: Option<Arc<ConditionResult>> = None;

        for (index, (condition, context)) in set.conditions().iter().zip(contexts).enumerate() {
            let step_start = Instant::now();
            *evaluation_count += 1;

            let (outcome, resolve_time) = if cancel.is_cancelled() {
                (EvaluationOutcome::fault(EvaluationError::Cancelled), Duration::ZERO)
            } else {
                self.run_condition(condition.as_ref(), context, cancel).await
            };

            record_condition_evaluation(condition.evaluator_name(), outcome_label(&outcome));
            if let Some(e) = &outcome.exception {
                warn!(condition = condition.name(), error = %e, "条件评估出现故障");
            }

            let result = Arc::new(ConditionResult {
                set_name: set.name().to_string(),
                set_value: set.value().to_string(),
                condition_name: condition.name().to_string(),
                condition_index: index,
                context_type: condition.context_type().name().to_string(),
                to_evaluate: condition.to_evaluate().to_string(),
                data: (*context).clone(),
                evaluator_name: condition.evaluator_name().to_string(),
                is_success: outcome.is_success,
                failure_message: outcome.failure_message,
                exception: outcome.exception,
                resolve_time,
                step_time: step_start.elapsed(),
                cumulative_time: set_start.elapsed(),
                tenant_id: tenant_id.to_string(),
                evaluation_chain: previous.take(),
            });

            if let Some(descriptor) = condition.event() {
                self.publish_condition_event(descriptor, &result, cancel).await;
            }

            let stop = !result.is_success || result.exception.is_some();
            previous = Some(result);

            if stop {
                break;
            }
        }

        previous
    }

    /// 解析评估器并执行，评估器的错误和 panic 都转换为故障结果
    async fn run_condition(
        &self,
        condition: &dyn DynCondition,
        context: &RuleContext,
        cancel: &CancellationToken,
    ) -> (EvaluationOutcome, Duration) {
        let resolve_start = Instant::now();
        let context_type = condition.context_type();

        let resolved = catch_unwind(AssertUnwindSafe(|| {
            self.resolver
                .resolve(condition.evaluator_name(), &context_type)
        }));
        let resolve_time = resolve_start.elapsed();

        let evaluator = match resolved {
            Ok(Ok(evaluator)) => evaluator,
            Ok(Err(e)) => return (EvaluationOutcome::fault(e.into()), resolve_time),
            Err(panic) => {
                return (
                    EvaluationOutcome::fault(EvaluationError::Panicked(panic_message(&*panic))),
                    resolve_time,
                );
            }
        };

        let outcome = AssertUnwindSafe(evaluator.evaluate(condition, context, cancel))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                EvaluationOutcome::fault(EvaluationError::Panicked(panic_message(&*panic)))
            });

        (outcome, resolve_time)
    }

    async fn publish_condition_event(
        &self,
        descriptor: &EventDescriptor,
        result: &ConditionResult,
        cancel: &CancellationToken,
    ) {
        if !descriptor.should_publish(result.is_success) {
            return;
        }

        let mut details = EventDetails::new(
            &result.condition_name,
            SenderKind::Condition,
            &result.tenant_id,
            result.is_success,
        )
        .with_snapshot(result.data.snapshot());
        details.failure_messages.extend(result.failure_message.clone());
        details
            .exceptions
            .extend(result.exception.as_ref().map(ToString::to_string));

        self.events
            .publish_dyn(
                descriptor.event_type(),
                descriptor.create_event(details),
                cancel,
                descriptor.dispatch(),
            )
            .await;
    }

    async fn publish_rule_event(
        &self,
        descriptor: &EventDescriptor,
        rule: &Rule,
        result: &RuleResult,
        contexts: &[RuleContext],
        cancel: &CancellationToken,
    ) {
        if !descriptor.should_publish(result.is_success) {
            return;
        }

        let snapshot = contexts
            .iter()
            .map(RuleContext::snapshot)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(Value::Array);

        let mut details = EventDetails::new(
            rule.name(),
            SenderKind::Rule,
            &result.tenant_id,
            result.is_success,
        )
        .with_snapshot(snapshot);
        details.failure_messages = result.failure_messages.clone();
        details.exceptions = result.exceptions.iter().map(ToString::to_string).collect();

        self.events
            .publish_dyn(
                descriptor.event_type(),
                descriptor.create_event(details),
                cancel,
                descriptor.dispatch(),
            )
            .await;
    }
}

fn outcome_label(outcome: &EvaluationOutcome) -> &'static str {
    match (outcome.is_success, &outcome.exception) {
        (_, Some(_)) => "fault",
        (true, None) => "success",
        (false, None) => "failure",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}
