//! SharedData：会话级变量表
//!
//! 步骤的 output_variable 写入这里，后续步骤的参数占位符从这里取值。值使用 serde_json::Value
//! （string / number / bool / list / map / null），替换与校验语义不依赖反射。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 会话内共享变量（key -> JSON 值）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SharedData {
    values: BTreeMap<String, Value>,
}

impl SharedData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// 按名称或点分路径取值：先精确匹配整个 key，再按 `a.b.0` 逐层下钻（对象取字段、数组取下标）
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.values.get(path) {
            return Some(v);
        }
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// 取值并渲染为替换文本：字符串原样输出，其它类型输出紧凑 JSON
    pub fn render(&self, path: &str) -> Option<String> {
        self.lookup(path).map(render_value)
    }

    /// 记录步骤输出：能解析为 JSON 对象/数组的按结构化值保存，其余按字符串保存
    pub fn store_output(&mut self, key: impl Into<String>, output: &str) {
        let value = match serde_json::from_str::<Value>(output.trim()) {
            Ok(v @ (Value::Object(_) | Value::Array(_))) => v,
            _ => Value::String(output.to_string()),
        };
        self.values.insert(key.into(), value);
    }
}

pub(crate) fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
