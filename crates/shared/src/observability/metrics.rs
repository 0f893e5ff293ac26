//! 指标模块
//!
//! 基于 metrics facade 记录规则引擎指标。本模块只负责描述和记录，
//! 指标导出器（Prometheus 等）由宿主进程自行安装；未安装 recorder 时记录操作为空操作。

/// 注册规则引擎指标描述
///
/// 这些描述会出现在导出端点的 HELP 注释中
pub fn describe_metrics() {
    metrics::describe_counter!("rule_evaluations_total", "Total number of rule evaluations");
    metrics::describe_histogram!(
        "rule_evaluation_duration_seconds",
        "Rule evaluation duration in seconds"
    );

    metrics::describe_counter!(
        "condition_evaluations_total",
        "Total number of condition evaluations"
    );

    metrics::describe_counter!(
        "rule_cache_lookups_total",
        "Total number of cache lookups by cache and outcome"
    );

    metrics::describe_counter!(
        "event_dispatches_total",
        "Total number of event publications by dispatch mode"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录规则评估
#[inline]
pub fn record_rule_evaluation(rule_name: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "rule_evaluations_total",
        "rule" => rule_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "rule_evaluation_duration_seconds",
        "rule" => rule_name.to_string()
    )
    .record(duration_secs);
}

/// 记录条件评估
#[inline]
pub fn record_condition_evaluation(evaluator: &str, outcome: &str) {
    metrics::counter!(
        "condition_evaluations_total",
        "evaluator" => evaluator.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// 记录缓存查询
#[inline]
pub fn record_cache_lookup(cache: &str, hit: bool) {
    metrics::counter!(
        "rule_cache_lookups_total",
        "cache" => cache.to_string(),
        "outcome" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// 记录事件分发
#[inline]
pub fn record_event_dispatch(event_type: &str, mode: &str, handlers: usize) {
    metrics::counter!(
        "event_dispatches_total",
        "event_type" => event_type.to_string(),
        "mode" => mode.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "event_dispatch_handlers",
        "event_type" => event_type.to_string()
    )
    .record(handlers as f64);
}
