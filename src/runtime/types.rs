use bollard::models::ContainerStateStatusEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Empty,
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerState {
    /// Whether a container in this state can still produce output.
    ///
    /// A created container that never started is not alive; its `start`
    /// event launches a new follow loop.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::Restarting)
    }
}

impl AsRef<str> for ContainerState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Empty => "empty",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Removing => "removing",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Unknown => "unknown",
        }
    }
}

impl From<ContainerStateStatusEnum> for ContainerState {
    fn from(status: ContainerStateStatusEnum) -> Self {
        match status {
            ContainerStateStatusEnum::EMPTY => Self::Empty,
            ContainerStateStatusEnum::CREATED => Self::Created,
            ContainerStateStatusEnum::RUNNING => Self::Running,
            ContainerStateStatusEnum::PAUSED => Self::Paused,
            ContainerStateStatusEnum::RESTARTING => Self::Restarting,
            ContainerStateStatusEnum::REMOVING => Self::Removing,
            ContainerStateStatusEnum::EXITED => Self::Exited,
            ContainerStateStatusEnum::DEAD => Self::Dead,
        }
    }
}

/// Lifecycle statuses the agent reacts to. Anything else the runtime
/// reports is carried as `Other` and ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventStatus {
    Create,
    Start,
    Die,
    Kill,
    Oom,
    Stop,
    Destroy,
    Other(String),
}

impl From<&str> for EventStatus {
    fn from(status: &str) -> Self {
        match status {
            "create" => Self::Create,
            "start" => Self::Start,
            "die" => Self::Die,
            "kill" => Self::Kill,
            "oom" => Self::Oom,
            "stop" => Self::Stop,
            "destroy" => Self::Destroy,
            other => Self::Other(other.to_string()),
        }
    }
}

impl AsRef<str> for EventStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Create => "create",
            Self::Start => "start",
            Self::Die => "die",
            Self::Kill => "kill",
            Self::Oom => "oom",
            Self::Stop => "stop",
            Self::Destroy => "destroy",
            Self::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    pub id: String,
    pub status: EventStatus,
    /// Seconds since the epoch as reported by the runtime.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub image: String,
    /// Raw `KEY=VALUE` strings as the runtime reports them.
    pub env: Vec<String>,
    pub state: ContainerState,
}
