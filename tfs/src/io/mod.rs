//! Moving file contents between a [`TFS`](crate::TFS) and the host's own file system.
//! Nothing here touches file system state beyond ordinary opens, reads and writes.

mod external;
