use std::time::{Duration, Instant};

use crate::outputs::{Output, OutputError};
use crate::puppetdb;
use crate::transform::transform;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] puppetdb::Error),

    #[error("write output failed, {0}")]
    Output(#[from] OutputError),
}

/// Drives the fetch, transform and write cycle. Cycles never overlap, the
/// interval is the sleep between the end of one cycle and the start of the
/// next.
pub struct Poller {
    client: puppetdb::Client,
    proxy_url: Option<String>,
    output: Box<dyn Output>,
    interval: Duration,
}

impl Poller {
    pub fn new(
        client: puppetdb::Client,
        proxy_url: Option<String>,
        output: Box<dyn Output>,
        interval: Duration,
    ) -> Self {
        Poller {
            client,
            proxy_url,
            output,
            interval,
        }
    }

    /// Run one cycle, the output is not touched when the fetch fails.
    pub async fn poll(&mut self) -> Result<(), Error> {
        let start = Instant::now();

        let resources = self.client.fetch().await?;
        let snapshot = transform(&resources, self.proxy_url.as_deref());
        self.output.write_output(&snapshot).await?;

        debug!(
            message = "poll finished",
            resources = resources.len(),
            jobs = snapshot.len(),
            elapsed = ?start.elapsed(),
        );

        Ok(())
    }

    /// Poll until `shutdown` resolves. Errors are logged and the next cycle
    /// is the retry. Shutdown interrupts the sleep only, a running cycle
    /// finishes first.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            if let Err(err) = self.poll().await {
                error!(message = "poll failed", %err);
            }

            tokio::select! {
                biased;

                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(message = "poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use http::StatusCode;

    use super::*;
    use crate::resource::Snapshot;

    const RESPONSE: &str = r#"[
        {"certname": "s1", "parameters": {"job_name": "node", "targets": ["s1:9100"], "labels": {"env": "prod"}}},
        {"certname": "s2", "parameters": {"job_name": "node", "targets": ["s2:9100"], "labels": {"env": "dev"}}}
    ]"#;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Snapshot>>>);

    impl Recorder {
        fn snapshots(&self) -> Vec<Snapshot> {
            self.0.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Output for Recorder {
        async fn write_output(&mut self, snapshot: &Snapshot) -> Result<(), OutputError> {
            self.0.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    fn client(addr: std::net::SocketAddr) -> puppetdb::Client {
        puppetdb::Client::new(&puppetdb::Config {
            url: format!("http://{addr}"),
            timeout: Duration::from_secs(5),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn poll_once() {
        let addr =
            testify::http::serve(|_req| async { testify::http::respond(StatusCode::OK, RESPONSE) })
                .await;
        let recorder = Recorder::default();
        let mut poller = Poller::new(
            client(addr),
            None,
            Box::new(recorder.clone()),
            Duration::from_secs(5),
        );

        poller.poll().await.unwrap();

        let snapshots = recorder.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].len(), 1);
        assert_eq!(snapshots[0][0].job_name, "node");
        assert_eq!(snapshots[0][0].static_configs.len(), 2);
        assert_eq!(snapshots[0][0].static_configs[1].labels["certname"], "s2");
    }

    #[tokio::test]
    async fn failed_fetch_skips_output() {
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&requests);
        let addr = testify::http::serve(move |_req| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    testify::http::respond(StatusCode::SERVICE_UNAVAILABLE, "starting")
                } else {
                    testify::http::respond(StatusCode::OK, RESPONSE)
                }
            }
        })
        .await;

        let recorder = Recorder::default();
        let mut poller = Poller::new(
            client(addr),
            None,
            Box::new(recorder.clone()),
            Duration::from_secs(5),
        );

        assert!(matches!(poller.poll().await, Err(Error::Fetch(_))));
        assert!(recorder.snapshots().is_empty());

        poller.poll().await.unwrap();
        assert_eq!(recorder.snapshots().len(), 1);
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let addr =
            testify::http::serve(|_req| async { testify::http::respond(StatusCode::OK, RESPONSE) })
                .await;
        let recorder = Recorder::default();
        let poller = Poller::new(
            client(addr),
            None,
            Box::new(recorder.clone()),
            Duration::from_secs(3600),
        );

        // resolved already, so only the first cycle runs
        poller.run(std::future::ready(())).await;

        assert_eq!(recorder.snapshots().len(), 1);
    }

    #[tokio::test]
    async fn cycles_repeat() {
        let addr =
            testify::http::serve(|_req| async { testify::http::respond(StatusCode::OK, RESPONSE) })
                .await;
        let recorder = Recorder::default();
        let poller = Poller::new(
            client(addr),
            None,
            Box::new(recorder.clone()),
            Duration::from_millis(10),
        );

        let watched = recorder.clone();
        let shutdown = async move {
            while watched.snapshots().len() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        poller.run(shutdown).await;

        let snapshots = recorder.snapshots();
        assert!(snapshots.len() >= 3);
        assert!(snapshots.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
