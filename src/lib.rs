#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("layercake only works on linux or android");

#[macro_use] extern crate lazy_static;
#[macro_use] extern crate serde;

pub mod cleaner;
pub mod creator;
pub mod errors;
pub mod fetcher;
pub mod layer;
pub mod namespace;
pub mod ordinator;
pub mod registry;

mod lock;
mod quota;

pub use crate::{
    cleaner::ReferenceTracker,
    creator::{ContainerRootfs, LayerCreator},
    errors::CakeError,
    fetcher::{
        CompositeFetcher, FetchRequest, FetchRequestCreator, Image, ImageFetcher, LocalFetcher,
        RemoteV1Fetcher, RemoteV2Fetcher, VersionedFetcher,
    },
    layer::{Cake, LayerId, LayerMeta, LayerStream, VfsCake},
    lock::{LayerLock, LayerLockGuard},
    namespace::{IdTranslator, Mapping, Mappings, Namespacer, UidNamespacer},
    ordinator::{CakeOrdinator, QuotaScope, RootfsSpec},
    quota::QuotaedReader,
    registry::{DefaultRegistry, HttpRegistryProvider, RegistryProvider, Session},
};
