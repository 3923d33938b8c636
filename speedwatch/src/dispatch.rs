//! Hands finished trips to the renderer, publisher and archiver.
//!
//! The tracker runs inside the feed loop and must never wait on disk or
//! network. Finished trips are moved into a channel and a separate task does
//! the slow work. Rendering and archiving touch the filesystem and run on the
//! blocking pool. A failing collaborator is logged and the next one still
//! runs.

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use speedwatch_core::{TrackEvent, Trip};

use crate::archive::TripArchiver;
use crate::publish::TripPublisher;
use crate::render::TripRenderer;

/// Capacity of the trip channel between the feed loop and the dispatcher.
pub const TRIP_QUEUE: usize = 64;

/// What happened to one trip.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub trip: Trip,
    pub title: Option<String>,
    pub published: bool,
    pub archived: bool,
}

/// Totals over a dispatcher's lifetime. `reports` is only filled when asked
/// for, since each report holds a whole trip.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub trips: usize,
    pub published: usize,
    pub archived: usize,
    pub reports: Vec<DispatchReport>,
}

impl DispatchSummary {
    fn add(&mut self, report: DispatchReport, keep: bool) {
        self.trips += 1;
        self.published += usize::from(report.published);
        self.archived += usize::from(report.archived);
        if keep {
            self.reports.push(report);
        }
    }
}

pub struct TripDispatcher {
    renderer: Arc<dyn TripRenderer>,
    publisher: Option<Box<dyn TripPublisher>>,
    archiver: Option<Arc<Mutex<Box<dyn TripArchiver>>>>,
    keep_renders: bool,
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("blocking task panicked")?
}

impl TripDispatcher {
    pub fn new(renderer: Box<dyn TripRenderer>) -> Self {
        TripDispatcher {
            renderer: Arc::from(renderer),
            publisher: None,
            archiver: None,
            keep_renders: true,
        }
    }

    /// Publish every rendered trip. Published renders are deleted unless
    /// `keep_renders` is set.
    pub fn with_publisher(mut self, publisher: Box<dyn TripPublisher>, keep_renders: bool) -> Self {
        self.publisher = Some(publisher);
        self.keep_renders = keep_renders;
        self
    }

    pub fn with_archiver(mut self, archiver: Box<dyn TripArchiver>) -> Self {
        self.archiver = Some(Arc::new(Mutex::new(archiver)));
        self
    }

    /// Render, then publish, then archive one trip.
    pub async fn handle(&mut self, trip: Trip) -> DispatchReport {
        let trip = Arc::new(trip);
        let mut title = None;
        let mut published = false;
        let mut archived = false;

        let renderer = Arc::clone(&self.renderer);
        let job = Arc::clone(&trip);
        match blocking(move || renderer.render(&job)).await {
            Ok(rendering) => {
                title = Some(rendering.title.clone());
                if let Some(publisher) = &self.publisher {
                    match publisher.publish(&trip, &rendering).await {
                        Ok(()) => {
                            published = true;
                            if !self.keep_renders {
                                if let Err(e) = tokio::fs::remove_file(&rendering.path).await {
                                    warn!(path = %rendering.path.display(), error = %e, "could not remove render");
                                }
                            }
                        }
                        Err(e) => error!(vehicle = %trip.key, error = %format!("{e:#}"), "publishing failed"),
                    }
                }
            }
            Err(e) => error!(vehicle = %trip.key, error = %format!("{e:#}"), "rendering failed"),
        }

        if let Some(archiver) = &self.archiver {
            let archiver = Arc::clone(archiver);
            let job = Arc::clone(&trip);
            let result = blocking(move || {
                let mut archiver = archiver.lock().unwrap_or_else(PoisonError::into_inner);
                archiver.archive(&job)
            })
            .await;
            match result {
                Ok(_) => archived = true,
                Err(e) => error!(vehicle = %trip.key, error = %format!("{e:#}"), "archiving failed"),
            }
        }

        DispatchReport {
            trip: Arc::try_unwrap(trip).unwrap_or_else(|shared| (*shared).clone()),
            title,
            published,
            archived,
        }
    }
}

/// Run the dispatcher on its own task. The task ends once every sender is
/// dropped. Per-trip reports are kept only with `keep_reports`; a long-lived
/// feed loop should pass `false`.
pub fn spawn(
    mut dispatcher: TripDispatcher,
    capacity: usize,
    keep_reports: bool,
) -> (mpsc::Sender<Trip>, JoinHandle<DispatchSummary>) {
    let (tx, mut rx) = mpsc::channel::<Trip>(capacity);
    let handle = tokio::spawn(async move {
        let mut summary = DispatchSummary::default();
        while let Some(trip) = rx.recv().await {
            let report = dispatcher.handle(trip).await;
            summary.add(report, keep_reports);
        }
        summary
    });
    (tx, handle)
}

/// Send finished trips from a batch of tracker events to the dispatcher.
/// Returns how many trips were forwarded.
pub async fn forward_trips(events: Vec<TrackEvent>, tx: &mpsc::Sender<Trip>) -> usize {
    let mut sent = 0;
    for event in events {
        if let TrackEvent::Finalized(trip) = event {
            if tx.send(trip).await.is_err() {
                error!("trip dispatcher has stopped, dropping trip");
                continue;
            }
            sent += 1;
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use speedwatch_core::{MonitoredArea, VehicleKey};

    use crate::render::Rendering;

    struct FakeRenderer {
        fail: bool,
    }

    impl TripRenderer for FakeRenderer {
        fn render(&self, trip: &Trip) -> Result<Rendering> {
            if self.fail {
                return Err(anyhow!("no canvas"));
            }
            Ok(Rendering {
                path: PathBuf::from("/nonexistent/render.svg"),
                title: format!("Route {}", trip.key.route_number),
            })
        }
    }

    #[derive(Clone, Default)]
    struct FakePublisher {
        titles: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TripPublisher for FakePublisher {
        async fn publish(&self, _trip: &Trip, rendering: &Rendering) -> Result<()> {
            self.titles.lock().unwrap().push(rendering.title.clone());
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeArchiver {
        count: Arc<Mutex<usize>>,
    }

    impl TripArchiver for FakeArchiver {
        fn archive(&mut self, _trip: &Trip) -> Result<PathBuf> {
            *self.count.lock().unwrap() += 1;
            Ok(PathBuf::from("archive.csv"))
        }
    }

    fn trip(route: &str) -> Trip {
        Trip {
            key: VehicleKey {
                route_number: route.into(),
                route_name: "Westendinasema".into(),
                operating_day: "2022-03-01".into(),
                start_time: "07:55".into(),
            },
            samples: Vec::new(),
            area: MonitoredArea::new(60.20, 60.10, 25.10, 24.90, 50.0),
        }
    }

    #[tokio::test]
    async fn test_handle_all_collaborators() {
        let publisher = FakePublisher::default();
        let archiver = FakeArchiver::default();
        let mut dispatcher = TripDispatcher::new(Box::new(FakeRenderer { fail: false }))
            .with_publisher(Box::new(publisher.clone()), true)
            .with_archiver(Box::new(archiver.clone()));

        let report = dispatcher.handle(trip("550")).await;

        assert_eq!(report.title.as_deref(), Some("Route 550"));
        assert!(report.published);
        assert!(report.archived);
        assert_eq!(*publisher.titles.lock().unwrap(), vec!["Route 550"]);
        assert_eq!(*archiver.count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_render_failure_still_archives() {
        let publisher = FakePublisher::default();
        let archiver = FakeArchiver::default();
        let mut dispatcher = TripDispatcher::new(Box::new(FakeRenderer { fail: true }))
            .with_publisher(Box::new(publisher.clone()), true)
            .with_archiver(Box::new(archiver.clone()));

        let report = dispatcher.handle(trip("550")).await;

        assert!(report.title.is_none());
        assert!(!report.published);
        assert!(report.archived);
        assert!(publisher.titles.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_optional_collaborators() {
        let mut dispatcher = TripDispatcher::new(Box::new(FakeRenderer { fail: false }));
        let report = dispatcher.handle(trip("550")).await;
        assert!(report.title.is_some());
        assert!(!report.published);
        assert!(!report.archived);
    }

    #[tokio::test]
    async fn test_spawn_and_forward() {
        let dispatcher = TripDispatcher::new(Box::new(FakeRenderer { fail: false }));
        let (tx, handle) = spawn(dispatcher, 4, true);

        let events = vec![
            TrackEvent::Entered {
                key: trip("560").key,
                timestamp: 1,
            },
            TrackEvent::Finalized(trip("550")),
            TrackEvent::Expired {
                key: trip("570").key,
            },
            TrackEvent::Finalized(trip("580")),
        ];
        assert_eq!(forward_trips(events, &tx).await, 2);
        drop(tx);

        let summary = handle.await.unwrap();
        assert_eq!(summary.trips, 2);
        let routes: Vec<&str> = summary
            .reports
            .iter()
            .map(|r| r.trip.key.route_number.as_str())
            .collect();
        assert_eq!(routes, vec!["550", "580"]);
    }

    #[tokio::test]
    async fn test_spawn_without_reports_only_counts() {
        let archiver = FakeArchiver::default();
        let dispatcher = TripDispatcher::new(Box::new(FakeRenderer { fail: false }))
            .with_archiver(Box::new(archiver.clone()));
        let (tx, handle) = spawn(dispatcher, 4, false);

        for route in ["550", "560", "570"] {
            tx.send(trip(route)).await.unwrap();
        }
        drop(tx);

        let summary = handle.await.unwrap();
        assert_eq!(summary.trips, 3);
        assert_eq!(summary.archived, 3);
        assert_eq!(summary.published, 0);
        assert!(summary.reports.is_empty());
        assert_eq!(*archiver.count.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_panicking_renderer_is_contained() {
        struct PanickingRenderer;

        impl TripRenderer for PanickingRenderer {
            fn render(&self, _trip: &Trip) -> Result<Rendering> {
                panic!("renderer bug");
            }
        }

        let archiver = FakeArchiver::default();
        let mut dispatcher = TripDispatcher::new(Box::new(PanickingRenderer))
            .with_archiver(Box::new(archiver.clone()));

        let report = dispatcher.handle(trip("550")).await;
        assert!(report.title.is_none());
        assert!(report.archived);
        assert_eq!(report.trip.key.route_number, "550");
    }
}
