pub(crate) mod async_task;
mod topo;
pub(crate) use topo::*;
