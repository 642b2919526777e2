//! Image pull progress aggregation

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::AppError;
use crate::models::operation::ProgressDetail;

/// Start of the pull band in overall operation progress
pub const PULL_BAND_START: u8 = 15;

/// Width of the pull band in overall operation progress
pub const PULL_BAND_WIDTH: f64 = 65.0;

/// One progress report of an image pull
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullEvent {
    pub status: String,
    pub progress_detail: Option<ProgressDetail>,
}

impl PullEvent {
    /// Percent of the pull this event reports, if it reports any
    pub fn percent(&self) -> Option<f64> {
        let status = self.status.to_ascii_lowercase();
        if status.contains("download complete")
            || status.contains("pull complete")
            || status.contains("already exists")
            || status.contains("image is up to date")
            || status.contains("downloaded newer image")
        {
            return Some(100.0);
        }

        let detail = self.progress_detail.as_ref()?;
        if let Some(percent) = detail.percent {
            return Some(percent.clamp(0.0, 100.0));
        }
        match (detail.current, detail.total) {
            (Some(current), Some(total)) if total > 0 => {
                Some((current as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
            }
            _ => None,
        }
    }
}

/// Image pull client
#[async_trait]
pub trait ImagePuller: Send + Sync {
    /// Pull `image`, reporting progress through `on_event` zero or more times
    async fn pull(
        &self,
        image: &str,
        on_event: &(dyn Fn(PullEvent) + Send + Sync),
    ) -> Result<(), AppError>;
}

/// Running per-image maximum of pull percentages
#[derive(Debug, Clone, Default)]
pub struct PullProgressTracker {
    percents: HashMap<String, f64>,
}

impl PullProgressTracker {
    /// Track the given images, all starting at 0%
    pub fn new(images: &[String]) -> Self {
        Self {
            percents: images.iter().map(|image| (image.clone(), 0.0)).collect(),
        }
    }

    /// Record `event` for `image` and return the image's percent
    pub fn observe(&mut self, image: &str, event: &PullEvent) -> f64 {
        let entry = self.percents.entry(image.to_string()).or_insert(0.0);
        if let Some(percent) = event.percent() {
            *entry = entry.max(percent);
        }
        *entry
    }

    /// Mark `image` as fully pulled
    pub fn complete(&mut self, image: &str) {
        self.percents.insert(image.to_string(), 100.0);
    }

    pub fn image_percent(&self, image: &str) -> f64 {
        self.percents.get(image).copied().unwrap_or(0.0)
    }

    /// Mean of per-image percents, 100 when nothing is tracked
    pub fn overall(&self) -> f64 {
        if self.percents.is_empty() {
            return 100.0;
        }
        self.percents.values().sum::<f64>() / self.percents.len() as f64
    }

    /// Overall pull percent mapped into the operation's pull band
    pub fn banded(&self) -> u8 {
        let banded = f64::from(PULL_BAND_START) + self.overall() * PULL_BAND_WIDTH / 100.0;
        banded.floor().clamp(0.0, 100.0) as u8
    }
}

/// Progress of the whole pull phase after one event
#[derive(Debug, Clone)]
pub struct PullProgress {
    pub image: String,
    pub event: PullEvent,
    pub image_percent: f64,
    pub overall_percent: f64,
    /// Overall operation progress
    pub progress_percent: u8,
}

/// Receiver of pull progress
#[async_trait]
pub trait PullObserver: Send {
    async fn on_progress(&mut self, progress: PullProgress);
}

/// Pull `images` one after another, reporting every event to `observer`.
///
/// Stops at the first failing image.
pub async fn pull_all(
    puller: &dyn ImagePuller,
    images: &[String],
    observer: &mut dyn PullObserver,
) -> Result<(), AppError> {
    let mut tracker = PullProgressTracker::new(images);

    for image in images {
        let (tx, mut rx) = mpsc::unbounded_channel::<PullEvent>();
        let sink = move |event: PullEvent| {
            let _ = tx.send(event);
        };

        let pull = puller.pull(image, &sink);
        tokio::pin!(pull);

        let result = loop {
            tokio::select! {
                biased;
                Some(event) = rx.recv() => {
                    observer.on_progress(progress(&mut tracker, image, event)).await;
                }
                result = &mut pull => break result,
            }
        };

        while let Ok(event) = rx.try_recv() {
            observer.on_progress(progress(&mut tracker, image, event)).await;
        }

        result?;
        tracker.complete(image);
    }

    Ok(())
}

fn progress(tracker: &mut PullProgressTracker, image: &str, event: PullEvent) -> PullProgress {
    let image_percent = tracker.observe(image, &event);
    PullProgress {
        image: image.to_string(),
        event,
        image_percent,
        overall_percent: tracker.overall(),
        progress_percent: tracker.banded(),
    }
}
