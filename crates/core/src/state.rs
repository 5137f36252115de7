//! Numeric status codes shared with the orchestration platform.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum State {
    Ok = 200,
    BadRequest = 400,
    InternalError = 500,

    BadConfig = 1000,

    UpdateFailed = 8001,
    DeleteFailed = 8002,
    ValidateFailed = 8003,
    Updated = 8004,
    Deleted = 8005,

    Untouched = 9998,

    InitFailed = 10000,
    GetComponentSpecFailed = 10003,
    CreateProjectorFailed = 10004,
    K8sRemoveServiceFailed = 10005,
    K8sRemoveDeploymentFailed = 10006,
    K8sDeploymentFailed = 10007,
}

const ALL: [State; 16] = [
    State::Ok,
    State::BadRequest,
    State::InternalError,
    State::BadConfig,
    State::UpdateFailed,
    State::DeleteFailed,
    State::ValidateFailed,
    State::Updated,
    State::Deleted,
    State::Untouched,
    State::InitFailed,
    State::GetComponentSpecFailed,
    State::CreateProjectorFailed,
    State::K8sRemoveServiceFailed,
    State::K8sRemoveDeploymentFailed,
    State::K8sDeploymentFailed,
];

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Ok => "OK",
            State::BadRequest => "Bad Request",
            State::InternalError => "Internal Error",
            State::BadConfig => "Bad Config",
            State::UpdateFailed => "Update Failed",
            State::DeleteFailed => "Delete Failed",
            State::ValidateFailed => "Validate Failed",
            State::Updated => "Updated",
            State::Deleted => "Deleted",
            State::Untouched => "Untouched",
            State::InitFailed => "Init Failed",
            State::GetComponentSpecFailed => "Get Component Spec Failed",
            State::CreateProjectorFailed => "Create Projector Failed",
            State::K8sRemoveServiceFailed => "Remove K8s Service Failed",
            State::K8sRemoveDeploymentFailed => "Remove K8s Deployment Failed",
            State::K8sDeploymentFailed => "K8s Deployment Failed",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<State> for u16 {
    fn from(s: State) -> u16 {
        s as u16
    }
}

impl TryFrom<u16> for State {
    type Error = String;

    fn try_from(v: u16) -> Result<Self, Self::Error> {
        ALL.iter().copied().find(|s| *s as u16 == v).ok_or_else(|| format!("unknown state code {}", v))
    }
}
