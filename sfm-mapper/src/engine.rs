use crate::{
    connected_components, pair_id, Correspondences, EventBus, EventKind, ImageClaims, ImageId,
    IncrementalMapper, MapperError, MapperEvent, MapperSettings, Reconstruction,
    ReconstructionManager, RefinementScheduler, SharedReconstruction,
};
use log::*;
use parking_lot::{Mutex, RwLock};
use sfm_optimize::BundleAdjuster;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The state of the model a worker is growing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapperState {
    /// Find a seed pair and start a new model.
    Seed,
    /// Pick the next image to register.
    Select,
    Register(ImageId),
    Triangulate(ImageId),
    Refine,
    /// No candidate is left for the model.
    Stalled,
    Done,
}

/// The outcome of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapperSummary {
    /// Models left in the manager.
    pub models: usize,
    /// Registered images over every model left in the manager.
    pub registered_images: usize,
    pub discarded_models: usize,
    /// The run stopped because it was cancelled. Models may be partially grown.
    pub cancelled: bool,
}

/// Runs the incremental mapper over a correspondence graph, filling a [`ReconstructionManager`].
///
/// The controller either runs on the calling thread with [`MapperController::run`], or in the
/// background with [`MapperController::start`] and [`MapperController::wait`]. With more than
/// one thread several models grow concurrently, each owned by one worker, coordinated through
/// [`ImageClaims`].
pub struct MapperController<G: ?Sized> {
    engine: Engine<G>,
    handle: Mutex<Option<JoinHandle<Result<MapperSummary, MapperError>>>>,
}

impl<G> MapperController<G>
where
    G: Correspondences + ?Sized + 'static,
{
    pub fn new(
        graph: Arc<G>,
        manager: Arc<RwLock<ReconstructionManager>>,
        settings: MapperSettings,
    ) -> Self {
        Self {
            engine: Engine {
                graph,
                settings,
                adjuster: None,
                manager,
                events: Arc::new(EventBus::new()),
                cancel: Arc::new(AtomicBool::new(false)),
                image_names: None,
            },
            handle: Mutex::new(None),
        }
    }

    /// The optimizer used for pose refinement and bundle adjustment.
    #[must_use]
    pub fn adjuster(mut self, adjuster: Arc<dyn BundleAdjuster>) -> Self {
        self.engine.adjuster = Some(adjuster);
        self
    }

    /// Only reconstruct the images with these names.
    #[must_use]
    pub fn image_names(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.engine.image_names = Some(names.into_iter().collect());
        self
    }

    /// Call the handler for every event of the kind, on the worker that emits it.
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&MapperEvent) + Send + Sync + 'static,
    ) {
        self.engine.events.subscribe(kind, handler);
    }

    pub fn manager(&self) -> &Arc<RwLock<ReconstructionManager>> {
        &self.engine.manager
    }

    /// Run on a background thread.
    pub fn start(&self) -> Result<(), MapperError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(MapperError::AlreadyRunning);
        }
        let engine = self.engine.clone();
        *handle = Some(thread::spawn(move || engine.run()));
        Ok(())
    }

    /// Block until the run started with [`MapperController::start`] is done or cancelled.
    pub fn wait(&self) -> Result<MapperSummary, MapperError> {
        let handle = self.handle.lock().take().ok_or(MapperError::NotStarted)?;
        handle.join().map_err(|_| MapperError::WorkerPanicked)?
    }

    /// Ask the run to stop. Workers stop before selecting their next image.
    pub fn cancel(&self) {
        info!("mapper cancellation requested");
        self.engine.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.engine.cancel.load(Ordering::Acquire)
    }

    /// Run on the calling thread until done or cancelled.
    pub fn run(&self) -> Result<MapperSummary, MapperError> {
        self.engine.run()
    }
}

impl<G: ?Sized> core::fmt::Debug for MapperController<G> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MapperController")
            .field("settings", &self.engine.settings)
            .field("events", &self.engine.events)
            .field("cancelled", &self.engine.cancel.load(Ordering::Acquire))
            .finish()
    }
}

/// Everything a run needs, cheap to clone onto a background thread.
struct Engine<G: ?Sized> {
    graph: Arc<G>,
    settings: MapperSettings,
    adjuster: Option<Arc<dyn BundleAdjuster>>,
    manager: Arc<RwLock<ReconstructionManager>>,
    events: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
    image_names: Option<BTreeSet<String>>,
}

impl<G: ?Sized> Clone for Engine<G> {
    fn clone(&self) -> Self {
        Self {
            graph: self.graph.clone(),
            settings: self.settings,
            adjuster: self.adjuster.clone(),
            manager: self.manager.clone(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            image_names: self.image_names.clone(),
        }
    }
}

impl<G> Engine<G>
where
    G: Correspondences + ?Sized,
{
    fn run(&self) -> Result<MapperSummary, MapperError> {
        let graph = &*self.graph;
        let images: Vec<ImageId> = graph
            .image_ids()
            .into_iter()
            .filter(|&image| match (&self.image_names, graph.image(image)) {
                (Some(names), Some(graph_image)) => names.contains(&graph_image.name),
                (None, Some(_)) => true,
                (_, None) => false,
            })
            .collect();
        if images.is_empty() || graph.image_pairs().is_empty() {
            error!("cannot reconstruct: the correspondence graph has no images or no image pairs");
            return Err(MapperError::EmptyGraph);
        }
        let selected: BTreeSet<ImageId> = images.iter().copied().collect();
        let components = connected_components(graph, &selected);
        info!(
            "reconstructing {} images in {} connected components",
            images.len(),
            components.values().collect::<BTreeSet<_>>().len()
        );

        let run = Run {
            engine: self,
            claims: ImageClaims::new(images),
            components,
            seeds: Mutex::new(SeedState::default()),
            resume: Mutex::new(VecDeque::new()),
            next_tag: AtomicU64::new(0),
            discarded: AtomicUsize::new(0),
        };
        run.resume_existing_models();

        let num_threads = self.settings.num_threads.max(1);
        let results: Vec<Result<(), MapperError>> = thread::scope(|scope| {
            let workers: Vec<_> = (0..num_threads)
                .map(|_| scope.spawn(|| run.work()))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or(Err(MapperError::WorkerPanicked)))
                .collect()
        });
        for result in results {
            result?;
        }

        let cancelled = self.cancel.load(Ordering::Acquire);
        let manager = self.manager.read();
        let summary = MapperSummary {
            models: manager.len(),
            registered_images: manager
                .iter()
                .map(|model| model.read().num_registered_images())
                .sum(),
            discarded_models: run.discarded.load(Ordering::Acquire),
            cancelled,
        };
        if !run.seeds.lock().seeded_any && !cancelled {
            error!(
                "no model could be reconstructed from {} images: no seed pair satisfied the requirements",
                run.claims.unclaimed().count()
            );
            return Err(MapperError::NoSeedPair);
        }
        info!(
            "mapping finished with {} models, {} registered images and {} discarded models",
            summary.models, summary.registered_images, summary.discarded_models
        );
        Ok(summary)
    }
}

#[derive(Default)]
struct SeedState {
    /// Pairs that were tried, by pair id and whether the requirements were relaxed.
    tried: BTreeSet<(u64, bool)>,
    /// How often each image was part of a failed seed pair.
    failures: BTreeMap<ImageId, usize>,
    relaxed: bool,
    seeded_any: bool,
    /// Connected components a live model is growing in. No other model is seeded there.
    growing: BTreeSet<usize>,
}

/// A model and the worker state that grows it.
struct ModelTask<'g, G: ?Sized> {
    model: SharedReconstruction,
    tag: u64,
    component: Option<usize>,
    mapper: IncrementalMapper<'g, G>,
}

/// The state shared by the workers of one run.
struct Run<'e, G: ?Sized> {
    engine: &'e Engine<G>,
    claims: ImageClaims,
    /// The connected component of every image of the run.
    components: BTreeMap<ImageId, usize>,
    seeds: Mutex<SeedState>,
    /// Models that were in the manager before the run, with their claim tags and components.
    resume: Mutex<VecDeque<(SharedReconstruction, u64, Option<usize>)>>,
    next_tag: AtomicU64,
    discarded: AtomicUsize,
}

impl<'e, G> Run<'e, G>
where
    G: Correspondences + ?Sized,
{
    fn settings(&self) -> &MapperSettings {
        &self.engine.settings
    }

    fn is_cancelled(&self) -> bool {
        self.engine.cancel.load(Ordering::Acquire)
    }

    fn new_mapper(&self, settings: MapperSettings, tag: u64) -> IncrementalMapper<'e, G> {
        let mapper = IncrementalMapper::new(
            &*self.engine.graph,
            settings,
            self.settings().random_seed.wrapping_add(tag),
        );
        match &self.engine.adjuster {
            Some(adjuster) => mapper.adjuster(adjuster.clone()),
            None => mapper,
        }
    }

    fn new_scheduler(&self) -> RefinementScheduler {
        let scheduler = RefinementScheduler::new(*self.settings());
        match &self.engine.adjuster {
            Some(adjuster) => scheduler.adjuster(adjuster.clone()),
            None => scheduler,
        }
    }

    /// Claim the registered images of the models already in the manager.
    fn resume_existing_models(&self) {
        let manager = self.engine.manager.read();
        let mut resume = self.resume.lock();
        let mut seeds = self.seeds.lock();
        for model in manager.iter() {
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            let reconstruction = model.read();
            for &image in reconstruction.registered_images() {
                if !self.claims.claim(image, tag) {
                    warn!("image {} is registered in more than one model", image);
                }
            }
            if reconstruction.num_registered_images() > 0 {
                let component = reconstruction
                    .registered_images()
                    .iter()
                    .find_map(|image| self.components.get(image).copied());
                info!(
                    "resuming a model with {} registered images",
                    reconstruction.num_registered_images()
                );
                seeds.growing.extend(component);
                resume.push_back((model.clone(), tag, component));
            }
        }
        if !resume.is_empty() {
            seeds.seeded_any = true;
        }
    }

    /// Grow models until no model can be started any more.
    fn work(&self) -> Result<(), MapperError> {
        loop {
            if self.is_cancelled() {
                return Ok(());
            }
            let resumed = self.resume.lock().pop_front();
            let task = match resumed {
                Some((model, tag, component)) => ModelTask {
                    model,
                    tag,
                    component,
                    mapper: self.new_mapper(*self.settings(), tag),
                },
                None => match self.seed()? {
                    Some(task) => task,
                    None => return Ok(()),
                },
            };
            let component = task.component;
            let grown = self.grow(task);
            if let Some(component) = component {
                self.seeds.lock().growing.remove(&component);
            }
            grown?;
        }
    }

    fn may_seed(&self, seeds: &SeedState) -> bool {
        if seeds.seeded_any && !self.settings().multiple_models {
            return false;
        }
        self.engine.manager.read().len() < self.settings().max_num_models
    }

    /// Start a new model from the best seed pair among unclaimed images.
    ///
    /// Only components that no live model grows in are seeded, so that concurrent models never
    /// split one component between them. If no model was started yet and every pair failed, the
    /// seeding requirements are relaxed once and every pair is tried again.
    fn seed(&self) -> Result<Option<ModelTask<'e, G>>, MapperError> {
        let mut seeds = self.seeds.lock();
        loop {
            if self.is_cancelled() || !self.may_seed(&seeds) {
                return Ok(None);
            }
            let relaxed = seeds.relaxed;
            let settings = if relaxed {
                self.settings().relaxed_seed()
            } else {
                *self.settings()
            };
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            let mut mapper = self.new_mapper(settings, tag);
            let max_failures = self.settings().init_max_reg_trials;

            let pairs = {
                let failures = &seeds.failures;
                let growing = &seeds.growing;
                mapper.seed_pairs(|image| {
                    self.claims.contains(image)
                        && self.claims.owner(image).is_none()
                        && failures.get(&image).map_or(true, |&n| n < max_failures)
                        && self
                            .components
                            .get(&image)
                            .map_or(false, |component| !growing.contains(component))
                })
            };
            for pair in pairs {
                if self.is_cancelled() {
                    return Ok(None);
                }
                let exhausted =
                    |image| seeds.failures.get(&image).map_or(false, |&n| n >= max_failures);
                if exhausted(pair.a) || exhausted(pair.b) {
                    continue;
                }
                if !seeds.tried.insert((pair_id(pair.a, pair.b), relaxed)) {
                    continue;
                }
                if !self.claims.claim(pair.a, tag) {
                    continue;
                }
                if !self.claims.claim(pair.b, tag) {
                    self.claims.release(pair.a, tag);
                    continue;
                }

                debug!(
                    "trying seed pair {} {} with {} matches",
                    pair.a, pair.b, pair.num_matches
                );
                let mut reconstruction = Reconstruction::new();
                let created = match mapper.estimate_seed(pair.a, pair.b) {
                    Some(geometry) => mapper.initialize(&mut reconstruction, &geometry)?,
                    None => 0,
                };
                if created == 0 {
                    self.claims.release(pair.a, tag);
                    self.claims.release(pair.b, tag);
                    *seeds.failures.entry(pair.a).or_insert(0) += 1;
                    *seeds.failures.entry(pair.b).or_insert(0) += 1;
                    continue;
                }

                seeds.seeded_any = true;
                let component = self.components.get(&pair.a).copied();
                seeds.growing.extend(component);
                let (index, model) = self.engine.manager.write().push(reconstruction);
                info!(
                    "started model {} from images {} and {} with {} tracks",
                    index, pair.a, pair.b, created
                );
                return Ok(Some(ModelTask {
                    model,
                    tag,
                    component,
                    mapper,
                }));
            }

            if !relaxed && !seeds.seeded_any {
                warn!("no seed pair satisfied the seeding requirements, relaxing them");
                seeds.relaxed = true;
                seeds.failures.clear();
                continue;
            }
            return Ok(None);
        }
    }

    /// Drive one model through the state machine until it stalls for good or the run is
    /// cancelled, then finalize or discard it.
    fn grow(&self, task: ModelTask<'e, G>) -> Result<(), MapperError> {
        let ModelTask {
            model,
            tag,
            mut mapper,
            ..
        } = task;
        let mut scheduler = self.new_scheduler();
        let mut stalled_at: Option<usize> = None;
        let mut state = MapperState::Select;

        loop {
            state = match state {
                MapperState::Seed | MapperState::Done => break,
                MapperState::Select => {
                    if self.is_cancelled() {
                        info!("mapper cancelled, keeping the model as it is");
                        return Ok(());
                    }
                    let candidates = {
                        let reconstruction = model.read();
                        mapper.candidates(&reconstruction, |image| {
                            self.claims.is_available(image, tag)
                        })
                    };
                    candidates
                        .iter()
                        .find(|candidate| self.claims.claim(candidate.image, tag))
                        .map_or(MapperState::Stalled, |candidate| {
                            debug!(
                                "selected image {} seeing {} points",
                                candidate.image, candidate.num_visible_points
                            );
                            MapperState::Register(candidate.image)
                        })
                }
                MapperState::Register(image) => {
                    let registered = mapper.register_image(&mut model.write(), image)?;
                    if registered {
                        self.emit_registered(&model, image);
                        MapperState::Triangulate(image)
                    } else {
                        self.claims.release(image, tag);
                        MapperState::Select
                    }
                }
                MapperState::Triangulate(image) => {
                    let mut reconstruction = model.write();
                    mapper.triangulate_image(&mut reconstruction, image)?;
                    let filtered = mapper.filter_image_tracks(&mut reconstruction, image)?;
                    debug!(
                        "image {}: filtered {} observations and {} tracks",
                        image, filtered.observations, filtered.tracks
                    );
                    MapperState::Refine
                }
                MapperState::Refine => {
                    let mut reconstruction = model.write();
                    scheduler.refine_after_registration(&mut reconstruction, &mut mapper)?;
                    self.release_deregistered(&reconstruction, tag);
                    MapperState::Select
                }
                MapperState::Stalled => {
                    let mut reconstruction = model.write();
                    let num_registered = reconstruction.num_registered_images();
                    if stalled_at == Some(num_registered) || num_registered < 2 {
                        MapperState::Done
                    } else {
                        // A final global pass may connect more candidates.
                        scheduler.global_refine(&mut reconstruction, &mut mapper)?;
                        self.release_deregistered(&reconstruction, tag);
                        stalled_at = Some(num_registered);
                        MapperState::Select
                    }
                }
            };
            if self.settings().verify_invariants {
                model.read().sanity_check()?;
            }
        }

        self.finish(&model, tag);
        Ok(())
    }

    fn finish(&self, model: &SharedReconstruction, tag: u64) {
        let num_registered_images = model.read().num_registered_images();
        if num_registered_images < self.settings().min_model_size {
            let index = self.engine.manager.write().remove_model(model);
            let released = self.claims.release_all(tag);
            self.discarded.fetch_add(1, Ordering::AcqRel);
            info!(
                "discarding model with {} registered images, releasing {} images",
                num_registered_images, released
            );
            if let Some(index) = index {
                self.engine.events.emit(&MapperEvent::ModelDiscarded {
                    model: index,
                    num_registered_images,
                });
            }
        } else {
            let index = self.engine.manager.read().position(model);
            info!("finalized model with {} registered images", num_registered_images);
            if let Some(index) = index {
                self.engine.events.emit(&MapperEvent::ModelFinalized {
                    model: index,
                    reconstruction: model.clone(),
                });
            }
        }
    }

    fn emit_registered(&self, model: &SharedReconstruction, image: ImageId) {
        let index = self.engine.manager.read().position(model);
        if let Some(index) = index {
            self.engine.events.emit(&MapperEvent::ImageRegistered {
                model: index,
                image,
                reconstruction: model.clone(),
            });
        }
    }

    /// Release the claims of images the model deregistered.
    fn release_deregistered(&self, reconstruction: &Reconstruction, tag: u64) {
        for image in self.engine.graph.image_ids() {
            if self.claims.owner(image) == Some(tag) && !reconstruction.is_registered(image) {
                debug!("releasing deregistered image {}", image);
                self.claims.release(image, tag);
            }
        }
    }
}
