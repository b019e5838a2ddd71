//! # Request Handling Contract
//!
//! The boundary between the crop-management backend and the engine. The
//! backend owns HTTP framing, authentication and storage; it hands this layer a
//! decoded JSON body and sends back whatever JSON comes out.
//!
//! Request bodies:
//!
//! ```json
//! { "area": 100.0, "temperature": 25.0 }          // "temp" is accepted too
//! { "items": [ { "area": 1.0, "temperature": 21.0 }, ... ] }
//! ```
//!
//! Responses:
//!
//! ```json
//! { "success": true,  "producao_estimada": 300.0 }
//! { "success": true,  "producoes_estimadas": [63.0, ...] }
//! { "success": false, "error": "..." }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::backend::ComputeBackend;
use crate::engine::SimulationEngine;
use crate::model::{YieldRequest, YieldSample};

/// A decoded simulation request body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SimulationPayload {
    Batch { items: Vec<YieldSample> },
    Single(YieldSample),
}

impl SimulationPayload {
    fn samples(&self) -> &[YieldSample] {
        match self {
            Self::Batch { items } => items,
            Self::Single(sample) => std::slice::from_ref(sample),
        }
    }
}

/// Response body handed back to the caller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SimulationResponse {
    Single {
        success: bool,
        producao_estimada: f32,
    },
    Batch {
        success: bool,
        producoes_estimadas: Vec<f32>,
    },
    Failure {
        success: bool,
        error: String,
    },
}

impl SimulationResponse {
    pub fn single(value: f32) -> Self {
        Self::Single {
            success: true,
            producao_estimada: value,
        }
    }

    pub fn batch(values: Vec<f32>) -> Self {
        Self::Batch {
            success: true,
            producoes_estimadas: values,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            Self::Single { success, .. }
            | Self::Batch { success, .. }
            | Self::Failure { success, .. } => *success,
        }
    }
}

/// Maps decoded requests onto a shared engine.
pub struct SimulationHandler<B: ComputeBackend> {
    engine: Arc<SimulationEngine<B>>,
}

impl<B: ComputeBackend> Clone for SimulationHandler<B> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<B: ComputeBackend> SimulationHandler<B> {
    pub fn new(engine: Arc<SimulationEngine<B>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SimulationEngine<B>> {
        &self.engine
    }

    /// Run a decoded request. Device errors become `success: false`.
    pub fn handle(&self, payload: &SimulationPayload) -> SimulationResponse {
        if !payload.samples().iter().all(YieldSample::is_finite) {
            return SimulationResponse::failure("area and temperature must be finite numbers");
        }

        let request: YieldRequest = payload.samples().iter().copied().collect();
        debug!("Handling simulation request with {} item(s)", request.len());

        match (payload, self.engine.simulate(&request)) {
            (_, Err(err)) => SimulationResponse::failure(err.to_string()),
            // JSON has no encoding for inf/NaN.
            (_, Ok(result)) if !result.values().iter().all(|v| v.is_finite()) => {
                SimulationResponse::failure("estimated yield is out of range")
            }
            (SimulationPayload::Single(_), Ok(result)) => match result.get(0) {
                Some(value) => SimulationResponse::single(value),
                None => SimulationResponse::failure("simulation produced no result"),
            },
            (SimulationPayload::Batch { .. }, Ok(result)) => {
                SimulationResponse::batch(result.into_vec())
            }
        }
    }

    /// Decode a JSON body and run it. A body that does not decode is a
    /// failure response, not an error.
    pub fn respond(&self, body: &str) -> SimulationResponse {
        match serde_json::from_str::<SimulationPayload>(body) {
            Ok(payload) => self.handle(&payload),
            Err(e) => SimulationResponse::failure(format!("invalid request: {}", e)),
        }
    }

    /// Decode a JSON body, run it, and encode the response.
    pub fn handle_json(&self, body: &str) -> String {
        let response = self.respond(body);
        serde_json::to_string(&response).unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "error": e.to_string() }).to_string()
        })
    }
}
