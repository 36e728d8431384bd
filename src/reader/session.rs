use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{timeout, Instant},
};

use super::{ConnectionConfig, SessionError, SessionTimeouts};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const USERNAME_PROMPT: &str = "Username>";
const PASSWORD_PROMPT: &str = "Password>";
const COMMAND_PROMPT: &str = "Alien>";
const LOGIN_REJECTED_MARKERS: [&str; 2] = [USERNAME_PROMPT, "Invalid"];

/// Prefix that switches the reader into non-interactive replies, which are
/// terminated by a NUL byte instead of a prompt.
const NON_INTERACTIVE_PREFIX: char = '\x01';
const REPLY_TERMINATOR: u8 = 0;

pub const TAG_LIST_COMMAND: &str = "t";
const QUIT_COMMAND: &str = "quit";

const READ_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Failed,
}

/// Anything the scanner can poll for a tag list.
#[async_trait]
pub trait TagSource: Send + 'static {
    fn state(&self) -> SessionState;

    async fn open(&mut self) -> Result<(), SessionError>;

    /// Returns the raw tag-list reply. Valid only while open.
    async fn poll(&mut self) -> Result<String, SessionError>;

    /// Always leaves the source closed.
    async fn close(&mut self);

    /// Replaces the connection settings. Only allowed while closed.
    fn reconfigure(&mut self, config: ConnectionConfig) -> anyhow::Result<()>;
}

/// Telnet-style session with an Alien reader.
pub struct AlienSession {
    config: ConnectionConfig,
    timeouts: SessionTimeouts,
    stream: Option<TcpStream>,
    state: SessionState,
}

impl AlienSession {
    pub fn new(config: ConnectionConfig, timeouts: SessionTimeouts) -> Self {
        Self {
            config,
            timeouts,
            stream: None,
            state: SessionState::Closed,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn connect_and_login(&mut self) -> Result<TcpStream, SessionError> {
        let address = self.config.address();
        let mut stream = match timeout(
            self.timeouts.connect,
            TcpStream::connect((self.config.host.as_str(), self.config.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                return Err(SessionError::Connection {
                    address,
                    message: err.to_string(),
                })
            }
            Err(_) => return Err(SessionError::timeout("connect", self.timeouts.connect)),
        };
        if let Err(err) = stream.set_nodelay(true) {
            log_warn!("could not disable Nagle on reader socket: {err}");
        }

        let response = self.timeouts.response;
        read_until_any(&mut stream, &[USERNAME_PROMPT], response, "login prompt")
            .await
            .map_err(|err| login_failure(err, &address))?;
        send_line(&mut stream, &self.config.username)
            .await
            .map_err(|err| login_failure(err, &address))?;

        read_until_any(&mut stream, &[PASSWORD_PROMPT], response, "password prompt")
            .await
            .map_err(|err| login_failure(err, &address))?;
        send_line(&mut stream, &self.config.password)
            .await
            .map_err(|err| login_failure(err, &address))?;

        let mut markers = vec![COMMAND_PROMPT];
        markers.extend(LOGIN_REJECTED_MARKERS);
        let (reply, matched) = read_until_any(&mut stream, &markers, response, "login")
            .await
            .map_err(|err| login_failure(err, &address))?;
        if markers[matched] != COMMAND_PROMPT {
            let reason = reply
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty() && !line.ends_with(USERNAME_PROMPT))
                .unwrap_or("invalid username or password")
                .to_string();
            return Err(SessionError::Auth(reason));
        }

        Ok(stream)
    }

    fn fail(&mut self) {
        self.stream = None;
        self.state = SessionState::Failed;
    }
}

#[async_trait]
impl TagSource for AlienSession {
    fn state(&self) -> SessionState {
        self.state
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Open {
            return Ok(());
        }

        self.stream = None;
        self.state = SessionState::Opening;
        match self.connect_and_login().await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SessionState::Open;
                log_info!("reader session open at {}", self.config.address());
                Ok(())
            }
            Err(err) => {
                self.fail();
                Err(err)
            }
        }
    }

    async fn poll(&mut self) -> Result<String, SessionError> {
        let response_timeout = self.timeouts.response;
        let stream = match (self.state, self.stream.as_mut()) {
            (SessionState::Open, Some(stream)) => stream,
            (state, _) => return Err(SessionError::NotOpen(state)),
        };

        let command = format!("{NON_INTERACTIVE_PREFIX}{TAG_LIST_COMMAND}");
        let result = match send_line(stream, &command).await {
            Ok(()) => read_reply(stream, response_timeout).await,
            Err(err) => Err(err),
        };

        if result.is_err() {
            self.fail();
        }
        result
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if self.state == SessionState::Open {
                if let Err(err) = send_line(&mut stream, QUIT_COMMAND).await {
                    log_warn!("failed to send quit to reader: {err}");
                }
            }
            if let Err(err) = stream.shutdown().await {
                log_warn!("failed to shut down reader connection: {err}");
            }
            log_info!("reader session closed");
        }
        self.state = SessionState::Closed;
    }

    fn reconfigure(&mut self, config: ConnectionConfig) -> anyhow::Result<()> {
        if self.state != SessionState::Closed {
            anyhow::bail!("cannot change reader settings while the session is {:?}", self.state);
        }
        config.validate()?;
        self.config = config;
        Ok(())
    }
}

async fn send_line(stream: &mut TcpStream, line: &str) -> Result<(), SessionError> {
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}

/// Reads until one of `markers` appears, returning the text read and the
/// index of the marker that matched.
async fn read_until_any(
    stream: &mut TcpStream,
    markers: &[&str],
    wait: std::time::Duration,
    operation: &'static str,
) -> Result<(String, usize), SessionError> {
    let deadline = Instant::now() + wait;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        {
            let text = String::from_utf8_lossy(&buffer);
            if let Some(index) = markers.iter().position(|marker| text.contains(marker)) {
                return Ok((text.into_owned(), index));
            }
        }

        let read = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => return Err(SessionError::timeout(operation, wait)),
        };
        if read == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("reader closed the connection while waiting for {operation}"),
            )));
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

/// Reads one command reply, ending at the NUL terminator or at a trailing
/// `Alien>` prompt when the reader answers interactively.
async fn read_reply(
    stream: &mut TcpStream,
    wait: std::time::Duration,
) -> Result<String, SessionError> {
    let deadline = Instant::now() + wait;
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        if let Some(end) = buffer.iter().position(|&byte| byte == REPLY_TERMINATOR) {
            return Ok(clean_reply(&String::from_utf8_lossy(&buffer[..end])));
        }
        {
            let text = String::from_utf8_lossy(&buffer);
            if let Some(body) = text.trim_end().strip_suffix(COMMAND_PROMPT) {
                return Ok(clean_reply(body));
            }
        }

        let read = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => return Err(SessionError::timeout("tag list", wait)),
        };
        if read == 0 {
            return Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "reader closed the connection mid-reply",
            )));
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

fn clean_reply(raw: &str) -> String {
    raw.trim_matches(|c: char| c == NON_INTERACTIVE_PREFIX || c.is_whitespace())
        .to_string()
}

/// While logging in, a dropped connection means the reader is unreachable
/// rather than a transport fault on an established session.
fn login_failure(err: SessionError, address: &str) -> SessionError {
    match err {
        SessionError::Io(io) => SessionError::Connection {
            address: address.to_string(),
            message: io.to_string(),
        },
        other => other,
    }
}
