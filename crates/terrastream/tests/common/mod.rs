//! Scripted fetcher and test rasters shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;

use terrastream::{Error, FetchFuture, FetchResponse, Fetcher, Raster, TileKey};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Transport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub bearer: Option<String>,
}

/// Answers from a per-URL script, falling back to a fixed reply. With a gate,
/// every request waits for a permit before answering.
pub struct MockFetcher {
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    fallback: Reply,
    calls: Mutex<Vec<Call>>,
    gate: Option<Semaphore>,
}

impl MockFetcher {
    pub fn new(fallback: Reply) -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    pub fn gated(fallback: Reply) -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::new(fallback)
        }
    }

    pub fn script(self, url: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .extend(replies);
        self
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.url).collect()
    }
}

impl Fetcher for MockFetcher {
    fn get<'a>(&'a self, url: &'a str, bearer: Option<&'a str>) -> FetchFuture<'a> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(Call {
                url: url.to_string(),
                bearer: bearer.map(str::to_string),
            });
            if let Some(gate) = &self.gate
                && let Ok(permit) = gate.acquire().await
            {
                permit.forget();
            }
            let reply = self
                .script
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| self.fallback.clone());
            match reply {
                Reply::Body(body) => Ok(FetchResponse::ok(body)),
                Reply::Status(status) => Ok(FetchResponse::status(status)),
                Reply::Transport => Err(Error::Http {
                    url: url.to_string(),
                    message: "connection reset".to_string(),
                }),
            }
        })
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A terrarium PNG whose every pixel encodes `height`.
pub fn png_tile(size: u32, height: f32) -> Vec<u8> {
    let heights = vec![height; (size * size) as usize];
    let raster = Raster::from_heights(size, size, &heights).unwrap();
    let mut bytes = Vec::new();
    raster
        .image()
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

pub fn url(template: &str, key: TileKey) -> String {
    template
        .replace("{z}", &key.zoom.to_string())
        .replace("{x}", &key.x.to_string())
        .replace("{y}", &key.y.to_string())
}

