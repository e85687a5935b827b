//! CLI command implementations.
//!
//! | Module  | Commands handled      |
//! |---------|-----------------------|
//! | `serve` | `Serve`               |
//! | `users` | `InitDb`, `AddUser`   |

pub mod serve;
pub mod users;

pub use serve::{ServeArgs, cmd_serve};
pub use users::{cmd_add_user, cmd_init_db};
