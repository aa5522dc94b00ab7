//! Probekit Core Library
//!
//! Builds probe artifacts, provisions modular runtimes inside test
//! containers and invokes tests by address inside them.

pub mod address;
pub mod archive;
pub mod catalog;
pub mod constants;
pub mod container;
pub mod error;
pub mod events;
pub mod filter;
pub mod framework;
pub mod identity;
pub mod obs;
pub mod options;
pub mod player;
pub mod probe;
pub mod reactor;
pub mod settings;
pub mod system;
pub mod telemetry;
pub mod wire;

pub use address::{TestAddress, TestDescription, TestInstantiationInstruction};
pub use archive::{content_digest, ArchiveBuilder, ArtifactArchive};
pub use catalog::{ActivatorContext, Catalog, TestContext};
pub use container::{
    ContainerState, NativeTestContainer, NativeTestContainerFactory, TestContainer,
    TestContainerFactory,
};
pub use error::{ExamError, ExamResult, TestFailure};
pub use events::{CollectingListener, EventNotifier, TestEvent, TestListener};
pub use filter::ServiceFilter;
pub use framework::{
    BundleId, BundleInfo, BundleState, Framework, FrameworkError, FrameworkEvent, FrameworkFactory,
    FrameworkResult, FrameworkState, MemoryFramework, MemoryFrameworkFactory, ProbeExtender,
    ServiceReference,
};
pub use identity::{ArtifactInfo, Version};
pub use options::{ExamOption, OptionKind, ProvisionOption, RepositoryOption};
pub use player::{PlayOutcome, PlayReport, Player};
pub use probe::{Probe, ProbeBuilder};
pub use reactor::{
    ExamReactor, PerConfiguration, PerTest, SharedContainer, StagedExamReactor, StagingStrategy,
};
pub use settings::ExamSettings;
pub use system::ExamSystem;
