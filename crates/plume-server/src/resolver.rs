//! Turning handler failures into wire statuses.
//!
//! A service registers either class-keyed mappings or a single catch-all
//! mapping function, never both. Failures matching neither fall back to the
//! built-in defaults, which never put a stack trace or cause chain on the
//! wire.

use plume_core::{
    CallError, CodecError, ConfigError, ErrorClass, Metadata, ResolvedStatus, ServiceError, Status,
};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Produces extra trailers for a mapped failure
pub type MetadataFn = Arc<dyn Fn(&ServiceError) -> Metadata + Send + Sync>;

type CatchAllFn = Arc<dyn Fn(&ServiceError) -> Option<ResolvedStatus> + Send + Sync>;

/// One class-keyed mapping
#[derive(Clone)]
pub struct ExceptionMapping {
    class: &'static ErrorClass,
    status: Status,
    metadata: Option<MetadataFn>,
    seq: usize,
}

impl ExceptionMapping {
    pub fn class(&self) -> &'static ErrorClass {
        self.class
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    fn produce(&self, error: &ServiceError) -> ResolvedStatus {
        let metadata = match &self.metadata {
            Some(f) => f(error),
            None => Metadata::new(),
        };
        ResolvedStatus::new(self.status.clone(), metadata)
    }
}

impl fmt::Debug for ExceptionMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExceptionMapping")
            .field("class", &self.class.name)
            .field("status", &self.status)
            .field("metadata", &self.metadata.is_some())
            .finish()
    }
}

/// Ordered class-keyed mappings.
///
/// A new mapping is inserted in front of the first registered mapping for one
/// of its ancestors, otherwise appended, so more specific classes come first.
#[derive(Debug, Clone, Default)]
pub struct ExceptionMappings {
    entries: Vec<ExceptionMapping>,
    next_seq: usize,
}

impl ExceptionMappings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        class: &'static ErrorClass,
        status: Status,
        metadata: Option<MetadataFn>,
    ) -> Result<(), ConfigError> {
        if let Some(existing) = self.entries.iter().find(|e| e.class.is(class)) {
            return Err(ConfigError::DuplicateMapping {
                class: class.name,
                existing: existing.status.to_string(),
            });
        }

        let mapping = ExceptionMapping {
            class,
            status,
            metadata,
            seq: self.next_seq,
        };
        self.next_seq += 1;

        match self.entries.iter().position(|e| class.is_a(e.class)) {
            Some(index) => self.entries.insert(index, mapping),
            None => self.entries.push(mapping),
        }
        Ok(())
    }

    /// Registered classes in match order
    pub fn classes(&self) -> impl Iterator<Item = &'static ErrorClass> + '_ {
        self.entries.iter().map(|e| e.class)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The mapping nearest to `class` in the class graph.
    ///
    /// Ties at equal distance (possible with several parents) go to the
    /// mapping registered last.
    pub fn find(&self, class: &ErrorClass) -> Option<&ExceptionMapping> {
        let mut best: Option<(usize, &ExceptionMapping)> = None;
        for entry in &self.entries {
            let Some(distance) = class.distance_to(entry.class) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((d, current)) => distance < d || (distance == d && entry.seq > current.seq),
            };
            if better {
                best = Some((distance, entry));
            }
        }
        best.map(|(_, entry)| entry)
    }
}

#[derive(Clone, Default)]
enum Mapping {
    #[default]
    None,
    Classes(ExceptionMappings),
    CatchAll(CatchAllFn),
}

/// Resolves handler failures to the status and trailers written on the wire
#[derive(Clone, Default)]
pub struct StatusResolver {
    mapping: Mapping,
    verbose: bool,
}

impl StatusResolver {
    pub fn builder() -> StatusResolverBuilder {
        StatusResolverBuilder::new()
    }

    /// Resolve a failure with no upstream trailers
    pub fn resolve(&self, error: ServiceError) -> ResolvedStatus {
        self.resolve_with(error, Metadata::new())
    }

    /// Resolve a failure, merging `upstream` trailers with any the mapping produces.
    ///
    /// Upstream keys win: produced metadata only adds keys not already present.
    pub fn resolve_with(&self, error: ServiceError, upstream: Metadata) -> ResolvedStatus {
        let resolved = match error.downcast_ref::<Status>() {
            // A failure that already is a status is its own answer.
            Some(status) => ResolvedStatus::of(status.clone()),
            None => match self.mapped(&error) {
                Some(resolved) => resolved,
                None => ResolvedStatus::of(self.default_status(&error)),
            },
        };

        debug!(class = error.class().name, code = %resolved.code(), "resolved handler failure");

        let (status, produced) = resolved.into_parts();
        let mut metadata = upstream;
        metadata.merge_absent(produced);

        let status = if status.cause().is_some() {
            status
        } else {
            status.with_cause(Arc::new(error))
        };
        ResolvedStatus::new(status, metadata)
    }

    /// Remap a status whose cause is a registered failure.
    ///
    /// Statuses without a cause, or whose cause no mapping recognizes, come
    /// back unchanged. A remapped status keeps the original cause.
    pub fn resolve_status(&self, status: Status, metadata: Metadata) -> ResolvedStatus {
        let Some(cause) = status.shared_cause() else {
            return ResolvedStatus::new(status, metadata);
        };
        let Some(error) = cause.downcast_ref::<ServiceError>() else {
            return ResolvedStatus::new(status, metadata);
        };
        let Some(resolved) = self.mapped(error) else {
            return ResolvedStatus::new(status, metadata);
        };

        let (mapped, produced) = resolved.into_parts();
        let mut merged = metadata;
        merged.merge_absent(produced);
        ResolvedStatus::new(mapped.with_cause(cause), merged)
    }

    /// Registered class-keyed mappings, if this resolver uses them
    pub fn mappings(&self) -> Option<&ExceptionMappings> {
        match &self.mapping {
            Mapping::Classes(mappings) => Some(mappings),
            _ => None,
        }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    fn mapped(&self, error: &ServiceError) -> Option<ResolvedStatus> {
        match &self.mapping {
            Mapping::None => None,
            Mapping::Classes(mappings) => mappings.find(error.class()).map(|m| m.produce(error)),
            Mapping::CatchAll(f) => f(error),
        }
    }

    fn default_status(&self, error: &ServiceError) -> Status {
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            return match io.kind() {
                std::io::ErrorKind::TimedOut => Status::deadline_exceeded("operation timed out"),
                _ => Status::unavailable("I/O failure"),
            };
        }
        if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Status::deadline_exceeded("deadline elapsed");
        }
        if let Some(call) = error.downcast_ref::<CallError>() {
            return match call {
                CallError::MessageTooLarge { .. } => Status::resource_exhausted(call.to_string()),
                CallError::Closed => Status::cancelled("call already closed"),
                _ => Status::internal(call.to_string()),
            };
        }
        if let Some(codec) = error.downcast_ref::<CodecError>() {
            return Status::internal(codec.to_string());
        }

        if self.verbose {
            Status::unknown(error.to_string())
        } else {
            Status::new(plume_core::Code::Unknown)
        }
    }
}

impl fmt::Debug for StatusResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mapping = match &self.mapping {
            Mapping::None => "none",
            Mapping::Classes(_) => "classes",
            Mapping::CatchAll(_) => "catch-all",
        };
        f.debug_struct("StatusResolver")
            .field("mapping", &mapping)
            .field("mappings", &self.mappings())
            .field("verbose", &self.verbose)
            .finish()
    }
}

/// Builder for [`StatusResolver`]; misconfiguration fails immediately
#[derive(Default)]
pub struct StatusResolverBuilder {
    resolver: StatusResolver,
}

impl StatusResolverBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map failures of `class` (and its descendants) to `status`
    pub fn add_exception_mapping(
        self,
        class: &'static ErrorClass,
        status: Status,
    ) -> Result<Self, ConfigError> {
        self.add_mapping(class, status, None)
    }

    /// Map failures of `class` to `status`, with trailers produced from the failure
    pub fn add_exception_mapping_with_metadata<F>(
        self,
        class: &'static ErrorClass,
        status: Status,
        metadata: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Metadata + Send + Sync + 'static,
    {
        self.add_mapping(class, status, Some(Arc::new(metadata)))
    }

    /// Resolve every failure through `f`; `None` falls back to the defaults
    pub fn exception_mapping<F>(self, f: F) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Option<Status> + Send + Sync + 'static,
    {
        self.set_catch_all(Arc::new(move |error| f(error).map(ResolvedStatus::of)))
    }

    /// Like [`exception_mapping`](Self::exception_mapping), producing trailers too
    pub fn exception_mapping_with_metadata<F>(self, f: F) -> Result<Self, ConfigError>
    where
        F: Fn(&ServiceError) -> Option<ResolvedStatus> + Send + Sync + 'static,
    {
        self.set_catch_all(Arc::new(f))
    }

    /// Include the failure's display text in UNKNOWN statuses
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.resolver.verbose = verbose;
        self
    }

    pub fn build(self) -> StatusResolver {
        self.resolver
    }

    fn add_mapping(
        mut self,
        class: &'static ErrorClass,
        status: Status,
        metadata: Option<MetadataFn>,
    ) -> Result<Self, ConfigError> {
        match &mut self.resolver.mapping {
            Mapping::CatchAll(_) => Err(ConfigError::MutuallyExclusive(
                "add_exception_mapping() and exception_mapping() are mutually exclusive.",
            )),
            Mapping::Classes(mappings) => {
                mappings.add(class, status, metadata)?;
                Ok(self)
            }
            Mapping::None => {
                let mut mappings = ExceptionMappings::new();
                mappings.add(class, status, metadata)?;
                self.resolver.mapping = Mapping::Classes(mappings);
                Ok(self)
            }
        }
    }

    fn set_catch_all(mut self, f: CatchAllFn) -> Result<Self, ConfigError> {
        match self.resolver.mapping {
            Mapping::Classes(_) => Err(ConfigError::MutuallyExclusive(
                "exception_mapping() and add_exception_mapping() are mutually exclusive.",
            )),
            Mapping::CatchAll(_) => Err(ConfigError::AlreadySet("exception_mapping()")),
            Mapping::None => {
                self.resolver.mapping = Mapping::CatchAll(f);
                Ok(self)
            }
        }
    }
}
