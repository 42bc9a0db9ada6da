//! Persistent entities of the workload control plane
//!
//! Every record carries `tenant_id`, `created` and `updated`. Builds,
//! releases and commands are append-only per WlApp; configs are versioned.

pub mod app;
pub mod build;
pub mod cluster;
pub mod config;
pub mod credential;
pub mod deployment;
pub mod domain;
pub mod plan;
pub mod process;
pub mod release;

pub use app::{
    AppType, Application, BuildConfig, BuildMethod, ConfigVar, ConfigVarScope, Environment,
    HookSpec, Module, ModuleEnv, SourceOrigin, WlApp,
};
pub use build::{ArtifactType, Build, BuildProcess, Command, CommandKind, JobStatus};
pub use cluster::{
    ApiServer, Cluster, ClusterAuth, ClusterFeatureFlag, ClusterType, DomainConfig,
    ExposedUrlType, IngressConfig, LogConfig,
};
pub use config::{Config, MapperVersion, MAPPER_VERSION_KEY};
pub use credential::{AppImageCredential, AppUserCredential, ImageCredentialRef};
pub use deployment::{
    ArchiveOperation, DeployFailure, DeployPhase, Deployment, OutputLine, OutputStream,
    PhaseKind, PhaseStatus,
};
pub use domain::{AppDomain, AppDomainSharedCert, AppSubpath, Domain, DomainSource};
pub use plan::{ResourcePlan, ResourceQuota};
pub use process::{
    AutoscalingConfig, DeclaredProcfile, ImagePullPolicy, MetricName, MetricTargetType, OverlayEnv, ProbeSet,
    ProcessSpec, ProcessSpecEnvOverlay, ScalingMetric,
};
pub use release::{Release, ZombieSet};
