pub mod codes;
pub mod import;
pub mod package;
pub mod routing;

pub use codes::{Code, CodeAllocator, CodeError, CodeGroup, CodeStatus, CodeStore, GroupStats, InMemoryCodeStore};
pub use import::{parse_batch, ImportError, MalformedLine, NewCode};
pub use package::{Package, PackageCatalog, PackageError};
pub use routing::{ProviderType, RoutingError, RoutingPlan, RoutingPolicyView, RoutingStats, RoutingStore};
