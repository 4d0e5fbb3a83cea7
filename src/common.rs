pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use chrono::Local;
pub use derivative::Derivative;
pub use futures::{
    future::{FutureExt as _, TryFutureExt as _},
    stream::{self, StreamExt as _, TryStreamExt as _},
};
pub use itertools::{chain, izip, Itertools};
pub use noisy_float::prelude::*;
pub use rand::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    fs, iter,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, OptimizerConfig},
    Device, Kind, Tensor,
};
pub use tokio::sync::mpsc;
pub use tracing::{debug, info, warn};

pub type Fallible<T> = Result<T>;
