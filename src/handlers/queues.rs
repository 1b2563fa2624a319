//! Per-endpoint queue status and circuit-breaker state (§4.2, §4.3, §5).

use axum::{extract::State, response::Json};
use serde::Serialize;

use crate::services::audio_queue::AudioQueueStatus;
use crate::services::circuit_breaker::CircuitState;
use crate::services::endpoint_queue::QueueStatus;
use crate::{AppState, Result};

#[derive(Serialize)]
pub struct QueuesResponse {
    pub text: QueueStatus,
    pub image: QueueStatus,
    pub audio: AudioQueueStatus,
    pub circuit_breakers: CircuitBreakerStates,
}

#[derive(Serialize)]
pub struct CircuitBreakerStates {
    pub text: CircuitStateView,
    pub image: CircuitStateView,
    pub audio: CircuitStateView,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateView {
    Closed,
    Open,
    HalfOpen,
}

impl From<CircuitState> for CircuitStateView {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Closed,
            CircuitState::Open => Self::Open,
            CircuitState::HalfOpen => Self::HalfOpen,
        }
    }
}

pub async fn get_queues_handler(State(state): State<AppState>) -> Result<Json<QueuesResponse>> {
    let deps = &state.deps;

    let text = deps.text_queue.status().await;
    let image = deps.image_queue.status().await;
    let audio = deps.audio_queue.status().await;

    let circuit_breakers = CircuitBreakerStates {
        text: deps.circuit_breaker.state("text").await.into(),
        image: deps.circuit_breaker.state("image").await.into(),
        audio: deps.circuit_breaker.state("audio").await.into(),
    };

    Ok(Json(QueuesResponse {
        text,
        image,
        audio,
        circuit_breakers,
    }))
}
