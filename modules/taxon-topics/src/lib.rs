pub mod artifacts;
pub mod engine;
pub mod identity;
pub mod keywords;
pub mod labeler;
pub mod model;

pub use artifacts::{FsModelStore, ModelSlot, ModelStore};
pub use engine::{ClusterRef, TopicEngine, TopicRunOutcome, TopicSettings, TopicStats};
pub use identity::IdentityResolver;
pub use labeler::TopicLabeler;
pub use model::{Membership, ModelSettings, TopicCluster, TopicModel};
