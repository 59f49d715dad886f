//! Example showing an optimistic edit on a cached profile.
//!
//! A profile is loaded through a [`TransformOverlay`]. The "follow" button
//! bumps the follower count locally right away, the request goes to the
//! server, and once the server answers the edit is expired so the next fetch
//! replaces it with the real count.
//!
//! Run with `RUST_LOG=cached_value=debug` to see the cache's own events.

use cached_value::{CacheBuilder, CacheConfig, CacheEvent, DiagnosticSink, Refreshable};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Profile {
    handle: String,
    followers: u32,
}

/// Stand-in for a remote API.
#[derive(Clone)]
struct Server {
    profile: Arc<Mutex<Profile>>,
}

impl Server {
    async fn fetch(&self) -> Result<Profile, std::io::Error> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(self.profile.lock().unwrap().clone())
    }

    async fn follow(&self) {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.profile.lock().unwrap().followers += 1;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let server = Server {
        profile: Arc::new(Mutex::new(Profile {
            handle: "chronark".to_string(),
            followers: 41,
        })),
    };

    // Configuration would normally come from a file
    let config: CacheConfig =
        serde_json::from_str(r#"{ "name": "profile", "expiration_ms": 30000 }"#)?;

    let sink: Arc<dyn DiagnosticSink> = Arc::new(|event: CacheEvent| {
        if let CacheEvent::Published {
            fetch_id: Some(id),
            latency_ms,
            ..
        } = event
        {
            println!("  [fetch #{}] published after {:.0}ms", id, latency_ms);
        }
    });

    let origin = server.clone();
    let profile = CacheBuilder::from_config(&config)
        .sink(sink)
        .build_overlay(move || {
            let origin = origin.clone();
            async move { origin.fetch().await }
        })?;

    // Render every update
    let mut updates = profile.subscribe();
    let render = tokio::spawn(async move {
        while let Some(p) = updates.recv().await {
            println!("@{}: {} followers", p.handle, p.followers);
        }
    });

    profile.get().await?;

    println!("Following...");
    let follow = profile.transform(|mut p: Profile| {
        p.followers += 1;
        p
    });
    server.follow().await;

    // The server has it now, so fresh data may replace the local edit
    follow.expire();
    profile.invalidate();
    profile.refresh_if_expired();
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!(
        "Server count: {} ({} transforms left)",
        profile.latest().map(|p| p.followers).unwrap_or_default(),
        profile.transform_count()
    );

    profile.close();
    render.await?;
    Ok(())
}
