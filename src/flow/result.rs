use std::fmt;

use serde::{Deserialize, Serialize};

/// 流程执行结果，按严重程度排序
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowResult {
    #[default]
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
}

impl FlowResult {
    /// 合并两个结果，取更差的一个
    pub fn combine(self, other: FlowResult) -> FlowResult {
        self.max(other)
    }

    pub fn is_better_than(self, other: FlowResult) -> bool {
        self < other
    }

    pub fn is_worse_or_equal_to(self, other: FlowResult) -> bool {
        self >= other
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowResult::Success => "SUCCESS",
            FlowResult::Unstable => "UNSTABLE",
            FlowResult::Failure => "FAILURE",
            FlowResult::NotBuilt => "NOT_BUILT",
            FlowResult::Aborted => "ABORTED",
        }
    }

    pub fn parse(value: &str) -> Option<FlowResult> {
        match value.to_ascii_uppercase().as_str() {
            "SUCCESS" => Some(FlowResult::Success),
            "UNSTABLE" => Some(FlowResult::Unstable),
            "FAILURE" => Some(FlowResult::Failure),
            "NOT_BUILT" => Some(FlowResult::NotBuilt),
            "ABORTED" => Some(FlowResult::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
