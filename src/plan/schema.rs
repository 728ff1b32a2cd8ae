//! Plan JSON Schema 生成（schemars）
//!
//! 供上游 Planner 拼入 prompt，约束模型输出合法的计划 JSON。

use schemars::schema_for;

use crate::plan::Plan;

/// 返回 Plan 的 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
