//! Wire types for the data-plane HTTP contract (`/analyze`, `/learn`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// `POST /analyze` body. The dataset always travels under `input_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub input_data: Map<String, Value>,
}

impl AnalysisRequest {
    /// Wrap `dataset`. An object that is already `{"input_data": {...}}` and nothing else is
    /// taken as-is rather than nested twice.
    pub fn wrap(dataset: Value) -> Result<Self, String> {
        match dataset {
            Value::Object(mut map) => {
                if map.len() == 1 {
                    if let Some(Value::Object(inner)) = map.remove("input_data") {
                        return Ok(Self { input_data: inner });
                    }
                }
                Ok(Self { input_data: map })
            }
            other => Err(format!(
                "dataset must be a JSON object, got {}",
                json_kind(&other)
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResponse {
    #[serde(default)]
    pub insights: Option<Value>,
    #[serde(default)]
    pub recommendations: Option<Value>,
    /// A `validation_result` that is not an object reads as absent.
    #[serde(default, deserialize_with = "lenient_validation")]
    pub validation_result: Option<ValidationResult>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `validation_result`. Every field is kept as raw JSON so an odd shape in one of them
/// never costs the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    #[serde(default)]
    pub overall_score: Option<Value>,
    #[serde(default)]
    pub criteria_scores: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn lenient_validation<'de, D>(deserializer: D) -> Result<Option<ValidationResult>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(v @ Value::Object(_)) => serde_json::from_value(v).ok(),
        _ => None,
    })
}

/// Extracted `validation_result.overall_score`.
#[derive(Debug, Clone, PartialEq)]
pub enum Score {
    Present(f64),
    Missing,
    NonNumeric(String),
    /// Numeric but outside [0, 1].
    OutOfRange(f64),
}

impl Score {
    pub fn value(&self) -> Option<f64> {
        match self {
            Score::Present(v) => Some(*v),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Score::Present(v) => format!("{:.4}", v),
            Score::Missing => "validation_result.overall_score is missing".to_string(),
            Score::NonNumeric(raw) => {
                format!("validation_result.overall_score is not a number: {}", raw)
            }
            Score::OutOfRange(v) => {
                format!("validation_result.overall_score {} is outside [0, 1]", v)
            }
        }
    }
}

impl AnalysisResponse {
    /// Parse a response body. Fails only when the body is not JSON at all; a JSON value
    /// that is not an object yields an empty response (no score).
    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(body)?;
        Ok(match value {
            Value::Object(_) => serde_json::from_value(value).unwrap_or_default(),
            _ => Self::default(),
        })
    }

    pub fn score(&self) -> Score {
        let Some(raw) = self
            .validation_result
            .as_ref()
            .and_then(|v| v.overall_score.as_ref())
        else {
            return Score::Missing;
        };
        match raw {
            Value::Null => Score::Missing,
            Value::Number(n) => match n.as_f64() {
                Some(v) if (0.0..=1.0).contains(&v) => Score::Present(v),
                Some(v) => Score::OutOfRange(v),
                None => Score::NonNumeric(n.to_string()),
            },
            other => Score::NonNumeric(other.to_string()),
        }
    }

    /// Numeric criteria only; anything else is dropped.
    pub fn numeric_criteria(&self) -> BTreeMap<String, f64> {
        self.validation_result
            .as_ref()
            .and_then(|v| v.criteria_scores.as_ref())
            .and_then(Value::as_object)
            .map(|criteria| {
                criteria
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub overall_score: f64,
    #[serde(default)]
    pub criteria_scores: BTreeMap<String, f64>,
}

/// `POST /learn` body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningFeedback {
    pub input_data: Map<String, Value>,
    pub prompt_result: Value,
    pub llm_response: Value,
    pub quality_score: f64,
    pub validation_result: ValidationSummary,
}

impl LearningFeedback {
    /// Feedback for a scored analysis run; None when the response has no usable score.
    pub fn from_analysis(request: &AnalysisRequest, response: &AnalysisResponse) -> Option<Self> {
        let score = response.score().value()?;
        let llm_response = json!({
            "insights": response.insights.clone().unwrap_or(Value::Null),
            "recommendations": response.recommendations.clone().unwrap_or(Value::Null),
        });
        Some(Self {
            input_data: request.input_data.clone(),
            prompt_result: response
                .extra
                .get("prompt_result")
                .cloned()
                .unwrap_or_else(|| json!({ "source": "autonomous_agent" })),
            llm_response,
            quality_score: score,
            validation_result: ValidationSummary {
                overall_score: score,
                criteria_scores: response.numeric_criteria(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnResponse {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub quality_improvement_active: bool,
    #[serde(default)]
    pub validation_score: Option<f64>,
}

/// Built-in business dataset used when no dataset file is configured.
pub fn sample_dataset() -> Value {
    json!({
        "transactions": [
            {"date": "2024-01-15", "amount": 12500.00, "category": "revenue", "description": "Client invoice INV-1042"},
            {"date": "2024-01-18", "amount": -3200.50, "category": "payroll", "description": "Contractor payment"},
            {"date": "2024-01-22", "amount": -845.20, "category": "operations", "description": "Cloud hosting"},
            {"date": "2024-02-02", "amount": 9800.00, "category": "revenue", "description": "Client invoice INV-1057"},
            {"date": "2024-02-09", "amount": -1500.00, "category": "marketing", "description": "Campaign spend"}
        ],
        "account_balance": 718391.91,
        "customer_id": "BIZ_0001"
    })
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
