//! Test doubles for the [`HttpClient`] seam.
//!
//! [`ScriptedHttp`] replays canned responses and records what was sent.
//! [`MockDevice`] is a small in-memory KLAP device: it runs the device side of
//! the handshake, decrypts commands and answers them encrypted, with knobs for
//! the failure modes the session code has to handle.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    Credentials,
    crypto::klap::{AuthHash, HASH_LEN, KlapCipher, SEED_LEN, handshake1_hash, handshake2_hash},
    error::Error,
    transport::{
        detect::DETECTION_PATH,
        handshake::{HANDSHAKE1_PATH, HANDSHAKE2_PATH},
        http::{HttpClient, HttpResponse},
        klap::REQUEST_PATH,
    },
};

/// One request seen by [`ScriptedHttp`].
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub path: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub cookie: Option<String>,
}

/// Replays queued responses in order; errors once the queue runs dry.
pub(crate) struct ScriptedHttp {
    responses: Mutex<VecDeque<Result<HttpResponse, Error>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedHttp {
    pub fn new(responses: Vec<Result<HttpResponse, Error>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedHttp {
    async fn post(
        &self,
        path: &str,
        content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        self.requests.lock().unwrap().push(RecordedRequest {
            path: path.to_string(),
            content_type: content_type.to_string(),
            body: body.to_vec(),
            cookie: cookie.map(str::to_string),
        });

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Error::ConnectionFailed("no scripted response left".into())))
    }

    fn host(&self) -> &str {
        "scripted"
    }

    fn port(&self) -> u16 {
        80
    }
}

/// A command the [`MockDevice`] decrypted and answered.
#[derive(Debug, Clone)]
pub(crate) struct DeviceRequest {
    pub seq: i32,
    pub method: String,
    pub params: Option<Value>,
    pub cookie: Option<String>,
    /// Sequence number the serving session started from.
    pub session_initial_seq: i32,
}

struct PendingHandshake {
    local_seed: [u8; SEED_LEN],
    remote_seed: [u8; SEED_LEN],
    cookie: String,
}

struct DeviceSession {
    cookie: String,
    cipher: KlapCipher,
    initial_seq: i32,
}

#[derive(Default)]
struct DeviceState {
    handshakes: usize,
    handshake2s: usize,
    forbidden: usize,
    pending: Option<PendingHandshake>,
    session: Option<DeviceSession>,
    requests: Vec<DeviceRequest>,
}

/// In-memory KLAP device.
pub(crate) struct MockDevice {
    auth_hash: AuthHash,
    forge_hash: bool,
    handshake2_status: Option<u16>,
    request_status: Option<u16>,
    forbid_remaining: Mutex<usize>,
    always_forbid: bool,
    error_code: i64,
    state: Mutex<DeviceState>,
}

impl MockDevice {
    /// A device provisioned with `credentials`.
    pub fn new(credentials: &Credentials) -> Self {
        Self {
            auth_hash: AuthHash::from_credentials(credentials),
            forge_hash: false,
            handshake2_status: None,
            request_status: None,
            forbid_remaining: Mutex::new(0),
            always_forbid: false,
            error_code: 0,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Answers handshake1 with a hash that matches nothing.
    pub fn forge_handshake_hash(mut self) -> Self {
        self.forge_hash = true;
        self
    }

    pub fn with_handshake2_status(mut self, status: u16) -> Self {
        self.handshake2_status = Some(status);
        self
    }

    /// Answers every command with `status` instead of an encrypted body.
    pub fn with_request_status(mut self, status: u16) -> Self {
        self.request_status = Some(status);
        self
    }

    /// Expires the session on the next `count` commands.
    pub fn forbid_requests(self, count: usize) -> Self {
        *self.forbid_remaining.lock().unwrap() = count;
        self
    }

    /// Expires the session on every command.
    pub fn always_forbid(mut self) -> Self {
        self.always_forbid = true;
        self
    }

    pub fn with_error_code(mut self, code: i64) -> Self {
        self.error_code = code;
        self
    }

    pub fn handshake_count(&self) -> usize {
        self.state.lock().unwrap().handshakes
    }

    pub fn handshake2_count(&self) -> usize {
        self.state.lock().unwrap().handshake2s
    }

    pub fn forbidden_count(&self) -> usize {
        self.state.lock().unwrap().forbidden
    }

    pub fn has_session(&self) -> bool {
        self.state.lock().unwrap().session.is_some()
    }

    pub fn requests(&self) -> Vec<DeviceRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn handshake1(&self, body: &[u8]) -> HttpResponse {
        let Ok(local_seed) = <[u8; SEED_LEN]>::try_from(body) else {
            return HttpResponse::new(400, Vec::new());
        };

        let mut state = self.state.lock().unwrap();
        state.handshakes += 1;
        let n = state.handshakes;

        let remote_seed = [0x10u8.wrapping_add(n as u8); SEED_LEN];
        let cookie = format!("session-{}", n);
        let server_hash = if self.forge_hash {
            [0xABu8; HASH_LEN]
        } else {
            handshake1_hash(&local_seed, &remote_seed, &self.auth_hash)
        };

        state.session = None;
        state.pending = Some(PendingHandshake {
            local_seed,
            remote_seed,
            cookie: cookie.clone(),
        });

        let mut response = remote_seed.to_vec();
        response.extend_from_slice(&server_hash);
        HttpResponse::new(200, response).with_session_cookie(cookie)
    }

    fn handshake2(&self, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        let mut state = self.state.lock().unwrap();
        state.handshake2s += 1;

        if let Some(status) = self.handshake2_status {
            state.pending = None;
            return HttpResponse::new(status, Vec::new());
        }

        let Some(pending) = state.pending.take() else {
            return HttpResponse::new(400, Vec::new());
        };

        let expected = handshake2_hash(&pending.local_seed, &pending.remote_seed, &self.auth_hash);
        if body != &expected[..] || cookie != Some(pending.cookie.as_str()) {
            return HttpResponse::new(401, Vec::new());
        }

        let cipher = KlapCipher::new(&pending.local_seed, &pending.remote_seed, &self.auth_hash);
        state.session = Some(DeviceSession {
            cookie: pending.cookie,
            initial_seq: cipher.seq(),
            cipher,
        });
        HttpResponse::new(200, Vec::new())
    }

    fn request(&self, path: &str, body: &[u8], cookie: Option<&str>) -> HttpResponse {
        let mut state = self.state.lock().unwrap();

        let expire = {
            let mut remaining = self.forbid_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                self.always_forbid
            }
        };
        if expire {
            state.forbidden += 1;
            state.session = None;
            return HttpResponse::new(403, Vec::new());
        }

        let Some(seq) = path
            .split_once("?seq=")
            .and_then(|(_, seq)| seq.parse::<i32>().ok())
        else {
            return HttpResponse::new(400, Vec::new());
        };

        let Some(session) = state.session.as_ref() else {
            return HttpResponse::new(403, Vec::new());
        };
        if cookie != Some(session.cookie.as_str()) {
            return HttpResponse::new(403, Vec::new());
        }

        let Ok(plaintext) = session.cipher.decrypt(body, seq) else {
            return HttpResponse::new(400, Vec::new());
        };
        let Ok(command) = serde_json::from_slice::<Value>(&plaintext) else {
            return HttpResponse::new(400, Vec::new());
        };

        let method = command["method"].as_str().unwrap_or_default().to_string();
        let response = if self.error_code == 0 {
            json!({"error_code": 0, "result": {"method": method}})
        } else {
            json!({"error_code": self.error_code})
        };
        let sealed = session
            .cipher
            .seal(response.to_string().as_bytes(), seq);
        let initial_seq = session.initial_seq;

        state.requests.push(DeviceRequest {
            seq,
            method,
            params: command.get("params").cloned(),
            cookie: cookie.map(str::to_string),
            session_initial_seq: initial_seq,
        });

        match self.request_status {
            Some(status) => HttpResponse::new(status, Vec::new()),
            None => HttpResponse::new(200, sealed),
        }
    }
}

#[async_trait]
impl HttpClient for MockDevice {
    async fn post(
        &self,
        path: &str,
        _content_type: &str,
        body: &[u8],
        cookie: Option<&str>,
    ) -> Result<HttpResponse, Error> {
        let response = match path {
            HANDSHAKE1_PATH => self.handshake1(body),
            HANDSHAKE2_PATH => self.handshake2(body, cookie),
            DETECTION_PATH => HttpResponse::new(200, r#"{"error_code":1003}"#),
            p if p.starts_with(REQUEST_PATH) => self.request(p, body, cookie),
            _ => HttpResponse::new(404, Vec::new()),
        };
        Ok(response)
    }

    fn host(&self) -> &str {
        "mock-device"
    }

    fn port(&self) -> u16 {
        80
    }
}
