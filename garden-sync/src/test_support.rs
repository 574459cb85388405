//! In-memory mirror and fixtures shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use garden_core::mirror::Result as MirrorResult;
use garden_core::{HttpGet, HttpResponse};
use sha1::{Digest, Sha1};
use url::Url;

/// Mirror answering from a script; anything unscripted is a 404
#[derive(Default)]
pub struct ScriptedMirror {
    served: Mutex<HashMap<String, Bytes>>,
    queued: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror that takes `delay` to answer every request
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Answer 200 with `body` for every request to `url`
    pub fn serve(&self, url: &str, body: impl Into<Bytes>) {
        self.served
            .lock()
            .unwrap()
            .insert(url.to_string(), body.into());
    }

    /// Answer `response` once, before any served body
    pub fn queue(&self, url: &str, response: HttpResponse) {
        self.queued
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl HttpGet for ScriptedMirror {
    async fn get(&self, url: &Url) -> MirrorResult<HttpResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let key = url.as_str().to_string();
        self.requests.lock().unwrap().push(key.clone());

        if let Some(response) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| q.pop_front())
        {
            return Ok(response);
        }

        match self.served.lock().unwrap().get(&key) {
            Some(body) => Ok(HttpResponse::new(200, body.clone())),
            None => Ok(HttpResponse::new(404, Bytes::new())),
        }
    }
}

pub fn sha1_hex(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

/// Manifest text for a tile folder listing `files`
pub fn manifest_text(folder: &str, files: &[(&str, &[u8])]) -> String {
    let mut text = format!("path:{}\nZ:{}:{}:1510000000\n", folder, folder, sha1_hex(folder.as_bytes()));
    for (name, content) in files {
        text.push_str(&format!("f:{}:{}:{}\n", name, sha1_hex(content), content.len()));
    }
    text
}
