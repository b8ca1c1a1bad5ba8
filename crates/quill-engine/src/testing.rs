use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use quill_contracts::providers::ProviderKind;
use quill_contracts::settings::{ApiProfile, Settings};

use crate::cancel::CancelToken;
use crate::error::GenerationResult;
use crate::text::{ChatRequest, TextChunks, TextProvider, TextProviderFactory};

const FAKE_DELAY_STEP: Duration = Duration::from_millis(5);

pub(crate) fn profile(id: &str, kind: ProviderKind) -> ApiProfile {
    ApiProfile {
        id: id.to_string(),
        name: id.to_string(),
        provider_type: kind,
        api_key: Some("test-key".to_string()),
        base_url: None,
    }
}

/// `main` (gateway, main narrative profile) and `claude` (anthropic).
pub(crate) fn settings_with_profiles() -> Settings {
    let mut settings = Settings::default();
    settings
        .api
        .profiles
        .push(profile("main", ProviderKind::RoutingGateway));
    settings
        .api
        .profiles
        .push(profile("claude", ProviderKind::Anthropic));
    settings.api.main_narrative_profile_id = Some("main".to_string());
    settings.api.default_model = "openai/gpt-4o-mini".to_string();
    settings
}

/// Serves one HTTP exchange on a loopback port: reads the request, waits
/// `delay`, then answers `status` with a JSON `body`. Returns the base URL.
pub(crate) fn serve_once(delay: Duration, status: u16, body: &'static str) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let base = format!("http://{}", listener.local_addr()?);
    thread::spawn(move || {
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        if read_request(&mut stream).is_err() {
            return;
        }
        thread::sleep(delay);
        let reply = format!(
            "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(reply.as_bytes());
    });
    Ok(base)
}

fn read_request(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let read = stream.read(&mut buf)?;
        if read == 0 {
            return Ok(());
        }
        data.extend_from_slice(&buf[..read]);
        let Some(head_end) = data.windows(4).position(|window| window == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&data[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        if data.len() >= head_end + 4 + length {
            return Ok(());
        }
    }
}

/// Replies are consumed in order; the last one repeats.
pub(crate) struct FakeTextProvider {
    replies: Mutex<VecDeque<Result<String, String>>>,
    requests: Mutex<Vec<ChatRequest>>,
    delay: Duration,
    finished: AtomicBool,
    abandoned: AtomicBool,
}

impl FakeTextProvider {
    fn next_reply(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let started = Instant::now();
        while started.elapsed() < self.delay {
            if CancelToken::tripped(cancel) {
                self.abandoned.store(true, Ordering::SeqCst);
                return Err(anyhow!("fake call cancelled"));
            }
            thread::sleep(FAKE_DELAY_STEP);
        }
        self.finished.store(true, Ordering::SeqCst);
        let mut replies = self
            .replies
            .lock()
            .map_err(|_| anyhow!("fake provider lock poisoned"))?;
        let reply = if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        };
        match reply {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("fake provider has no replies")),
        }
    }
}

impl TextProvider for FakeTextProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RoutingGateway
    }

    fn complete(&self, request: &ChatRequest, cancel: Option<&CancelToken>) -> Result<String> {
        self.next_reply(request, cancel)
    }

    fn stream(&self, request: &ChatRequest) -> Result<TextChunks> {
        let text = self.next_reply(request, None)?;
        let chunks = text
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect::<Vec<Result<String>>>();
        Ok(Box::new(chunks.into_iter()))
    }
}

pub(crate) struct FakeProviderFactory {
    provider: Arc<FakeTextProvider>,
    created: Mutex<Vec<String>>,
}

impl FakeProviderFactory {
    pub(crate) fn replying(text: &str) -> Self {
        Self::scripted(vec![Ok(text.to_string())])
    }

    pub(crate) fn scripted(replies: Vec<Result<String, String>>) -> Self {
        Self::build(replies, Duration::ZERO)
    }

    pub(crate) fn slow(text: &str, delay: Duration) -> Self {
        Self::build(vec![Ok(text.to_string())], delay)
    }

    fn build(replies: Vec<Result<String, String>>, delay: Duration) -> Self {
        Self {
            provider: Arc::new(FakeTextProvider {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
                delay,
                finished: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
            }),
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn created_profiles(&self) -> Vec<String> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }

    /// Whether a call ran its full delay and produced a reply.
    pub(crate) fn finished(&self) -> bool {
        self.provider.finished.load(Ordering::SeqCst)
    }

    /// Whether a call gave up part-way because its token tripped.
    pub(crate) fn abandoned(&self) -> bool {
        self.provider.abandoned.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.provider
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl TextProviderFactory for FakeProviderFactory {
    fn create(&self, profile: &ApiProfile) -> GenerationResult<Arc<dyn TextProvider>> {
        if let Ok(mut created) = self.created.lock() {
            created.push(profile.id.clone());
        }
        let provider: Arc<dyn TextProvider> = self.provider.clone();
        Ok(provider)
    }
}
