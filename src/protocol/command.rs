/// Single-byte command carried in every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Noop = 0,
    GrabJob = 1,
    SchedLater = 2,
    WorkDone = 3,
    WorkFail = 4,
    JobAssign = 5,
    NoJob = 6,
    CanDo = 7,
    CantDo = 8,
    Ping = 9,
    Pong = 10,
    Sleep = 11,
    Unknown = 12,
    SubmitJob = 13,
    Status = 14,
    DropFunc = 15,
    Success = 16,
    RemoveJob = 17,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let cmd = match value {
            0 => Command::Noop,
            1 => Command::GrabJob,
            2 => Command::SchedLater,
            3 => Command::WorkDone,
            4 => Command::WorkFail,
            5 => Command::JobAssign,
            6 => Command::NoJob,
            7 => Command::CanDo,
            8 => Command::CantDo,
            9 => Command::Ping,
            10 => Command::Pong,
            11 => Command::Sleep,
            12 => Command::Unknown,
            13 => Command::SubmitJob,
            14 => Command::Status,
            15 => Command::DropFunc,
            16 => Command::Success,
            17 => Command::RemoveJob,
            other => return Err(other),
        };
        Ok(cmd)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Noop => "NOOP",
            Command::GrabJob => "GRABJOB",
            Command::SchedLater => "SCHEDLATER",
            Command::WorkDone => "WORKDONE",
            Command::WorkFail => "WORKFAIL",
            Command::JobAssign => "JOBASSIGN",
            Command::NoJob => "NOJOB",
            Command::CanDo => "CANDO",
            Command::CantDo => "CANTDO",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Sleep => "SLEEP",
            Command::Unknown => "UNKNOWN",
            Command::SubmitJob => "SUBMITJOB",
            Command::Status => "STATUS",
            Command::DropFunc => "DROPFUNC",
            Command::Success => "SUCCESS",
            Command::RemoveJob => "REMOVEJOB",
        };
        write!(f, "{}", name)
    }
}

/// First frame sent on a fresh connection, announcing the peer's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientType {
    Client = 1,
    Worker = 2,
}

impl ClientType {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match frame {
            [1] => Some(ClientType::Client),
            [2] => Some(ClientType::Worker),
            _ => None,
        }
    }
}
