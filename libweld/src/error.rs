pub(crate) use anyhow::Context;
pub(crate) use anyhow::Error;
pub(crate) use anyhow::anyhow as error;
pub(crate) use anyhow::bail;
pub(crate) use anyhow::ensure;

pub type Result<T = (), E = Error> = core::result::Result<T, E>;
