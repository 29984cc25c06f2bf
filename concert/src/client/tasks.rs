//! Connection tasks run by the client's pending connection.

use std::time::Duration;

use crate::transport::{Response, ResponseCode, ResponseFuture};

use super::client::ClientCore;
use super::messages::{SessionInfo, SessionInfoResponse};
use super::pending::{ConnectionOutcome, ConnectionResultCode, ConnectionTask, TaskStatus};
use super::session::{ConnectionStatus, DisconnectReason};

/// Waits until a named server answers discovery.
///
/// Holds a discovery reference while running.
#[derive(Debug)]
pub struct DiscoverServerTask {
    server_name: String,
    started_at: Duration,
    discovering: bool,
    status: TaskStatus,
}

impl DiscoverServerTask {
    /// Wait for `server_name`.
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            started_at: Duration::ZERO,
            discovering: false,
            status: TaskStatus::Pending,
        }
    }

    fn check(&mut self, core: &mut ClientCore) {
        if core.find_server(&self.server_name).is_some() {
            self.finish(core, TaskStatus::Success);
        } else if core.now().saturating_sub(self.started_at) >= core.settings().discovery_timeout {
            let reason = format!("server '{}' was not discovered", self.server_name);
            self.finish(
                core,
                TaskStatus::Failed(ConnectionOutcome::new(ConnectionResultCode::TimedOut, reason)),
            );
        }
    }

    fn finish(&mut self, core: &mut ClientCore, status: TaskStatus) {
        self.release_discovery(core);
        self.status = status;
    }

    fn release_discovery(&mut self, core: &mut ClientCore) {
        if self.discovering {
            self.discovering = false;
            core.stop_discovery();
        }
    }
}

impl ConnectionTask<ClientCore> for DiscoverServerTask {
    fn execute(&mut self, core: &mut ClientCore) {
        self.started_at = core.now();
        self.discovering = true;
        core.start_discovery();
        self.check(core);
    }

    fn tick(&mut self, core: &mut ClientCore, should_cancel: bool) {
        if self.status != TaskStatus::Pending {
            return;
        }
        if should_cancel {
            self.finish(
                core,
                TaskStatus::Failed(ConnectionOutcome::new(
                    ConnectionResultCode::Canceled,
                    "server discovery canceled",
                )),
            );
            return;
        }
        self.check(core);
    }

    fn abort(&mut self, core: &mut ClientCore) {
        self.release_discovery(core);
    }

    fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    fn description(&self) -> String {
        format!("discover server '{}'", self.server_name)
    }
}

#[derive(Debug)]
enum Stage {
    Idle,
    Finding(ResponseFuture),
    Creating(ResponseFuture),
    Joining,
    Done,
}

/// Finds a session on a discovered server, creates it when missing, then
/// joins it.
#[derive(Debug)]
pub struct CreateOrJoinSessionTask {
    server_name: String,
    session_name: String,
    stage: Stage,
    status: TaskStatus,
}

impl CreateOrJoinSessionTask {
    /// Join `session_name` on `server_name`.
    pub fn new(server_name: impl Into<String>, session_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            session_name: session_name.into(),
            stage: Stage::Idle,
            status: TaskStatus::Pending,
        }
    }

    fn fail(&mut self, code: ConnectionResultCode, reason: impl Into<String>) {
        self.stage = Stage::Done;
        self.status = TaskStatus::Failed(ConnectionOutcome::new(code, reason));
    }

    fn fail_from_response(&mut self, response: &Response) {
        let code = match response.code {
            ResponseCode::TimedOut => ConnectionResultCode::TimedOut,
            _ => ConnectionResultCode::Failed,
        };
        self.fail(code, response.reason.clone());
    }

    fn already_joined(&self, core: &ClientCore) -> bool {
        core.session().map_or(false, |session| {
            let info = session.session_info();
            session.status() == ConnectionStatus::Connected
                && info.server_name == self.server_name
                && info.session_name == self.session_name
        })
    }

    fn join(&mut self, core: &mut ClientCore, info: SessionInfo) {
        tracing::info!(session = %info.session_name, server = %info.server_name, "joining session");
        core.join_session(info);
        self.stage = Stage::Joining;
    }

    fn on_found(&mut self, core: &mut ClientCore, response: Response) {
        if !response.is_success() {
            self.fail_from_response(&response);
            return;
        }
        match response.decode::<SessionInfoResponse>() {
            Ok(SessionInfoResponse { session: Some(info), .. }) => self.join(core, info),
            Ok(SessionInfoResponse { session: None, .. }) => {
                let Some(server) = core.find_server(&self.server_name) else {
                    self.fail(ConnectionResultCode::Failed, "server lost before session creation");
                    return;
                };
                match core.create_session(server.admin_endpoint_id, &self.session_name) {
                    Ok(future) => self.stage = Stage::Creating(future),
                    Err(e) => self.fail(ConnectionResultCode::Failed, e.to_string()),
                }
            }
            Err(e) => self.fail(ConnectionResultCode::Failed, e.to_string()),
        }
    }

    fn on_created(&mut self, core: &mut ClientCore, response: Response) {
        if !response.is_success() {
            self.fail_from_response(&response);
            return;
        }
        match response.decode::<SessionInfoResponse>() {
            Ok(SessionInfoResponse { session: Some(info), .. }) => self.join(core, info),
            Ok(SessionInfoResponse {
                session: None,
                reason,
            }) => self.fail(ConnectionResultCode::Failed, reason),
            Err(e) => self.fail(ConnectionResultCode::Failed, e.to_string()),
        }
    }

    fn check_join(&mut self, core: &ClientCore) {
        let Some(session) = core.session() else {
            self.fail(ConnectionResultCode::Failed, "session disconnected");
            return;
        };
        match session.status() {
            ConnectionStatus::Connected => {
                self.stage = Stage::Done;
                self.status = TaskStatus::Success;
            }
            ConnectionStatus::Connecting => self.stage = Stage::Joining,
            ConnectionStatus::Disconnected => {
                let (code, reason) = match session.disconnect_reason() {
                    Some(DisconnectReason::Rejected(reason)) => {
                        (ConnectionResultCode::Rejected, reason.clone())
                    }
                    Some(DisconnectReason::AttemptsExhausted) => (
                        ConnectionResultCode::TimedOut,
                        "session server did not answer".to_string(),
                    ),
                    Some(DisconnectReason::ServerLost) => {
                        (ConnectionResultCode::Failed, "session server lost".to_string())
                    }
                    _ => (ConnectionResultCode::Failed, "session disconnected".to_string()),
                };
                self.fail(code, reason);
            }
        }
    }
}

impl ConnectionTask<ClientCore> for CreateOrJoinSessionTask {
    fn execute(&mut self, core: &mut ClientCore) {
        if self.already_joined(core) {
            self.stage = Stage::Done;
            self.status = TaskStatus::Success;
            return;
        }
        let Some(server) = core.find_server(&self.server_name) else {
            let reason = format!("unknown server '{}'", self.server_name);
            self.fail(ConnectionResultCode::Failed, reason);
            return;
        };
        match core.find_session(server.admin_endpoint_id, &self.session_name) {
            Ok(future) => self.stage = Stage::Finding(future),
            Err(e) => self.fail(ConnectionResultCode::Failed, e.to_string()),
        }
    }

    fn tick(&mut self, core: &mut ClientCore, should_cancel: bool) {
        if self.status != TaskStatus::Pending {
            return;
        }
        if should_cancel {
            self.abort(core);
            self.fail(ConnectionResultCode::Canceled, "session join canceled");
            return;
        }
        match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Finding(mut future) => match future.try_response() {
                Some(response) => self.on_found(core, response),
                None => self.stage = Stage::Finding(future),
            },
            Stage::Creating(mut future) => match future.try_response() {
                Some(response) => self.on_created(core, response),
                None => self.stage = Stage::Creating(future),
            },
            Stage::Joining => self.check_join(core),
            stage @ (Stage::Idle | Stage::Done) => self.stage = stage,
        }
    }

    fn abort(&mut self, core: &mut ClientCore) {
        if matches!(self.stage, Stage::Joining)
            && core.connection_status() != ConnectionStatus::Connected
        {
            core.disconnect_session();
        }
        self.stage = Stage::Done;
    }

    fn status(&self) -> TaskStatus {
        self.status.clone()
    }

    fn description(&self) -> String {
        format!("create or join session '{}' on '{}'", self.session_name, self.server_name)
    }
}
