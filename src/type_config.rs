use std::fmt::Debug;

use crate::MetadataStore;
use crate::RaftLog;
use crate::StateMachine;
use crate::Transport;

/// Bundles the collaborator types one core instance is parameterized over.
///
/// **This coding style learned from OpenRaft project type config.**
pub trait TypeConfig:
    Sync + Send + Sized + Debug + Clone + Copy + Default + Eq + PartialEq + Ord + PartialOrd + 'static
{
    type R: RaftLog;

    type TR: Transport;

    type SM: StateMachine;

    type MS: MetadataStore;
}

pub mod alias {
    use super::TypeConfig;

    pub type ROF<T> = <T as TypeConfig>::R;

    pub type TROF<T> = <T as TypeConfig>::TR;

    pub type SMOF<T> = <T as TypeConfig>::SM;

    pub type MSOF<T> = <T as TypeConfig>::MS;
}
