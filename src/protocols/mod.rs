//! Message transformations.
//!
//! Pure functions with no state and no I/O, used by the runtime to turn a
//! received message into its reply:
//! - `transmogrify`: toggle the case of every ASCII letter
//! - `reverse`: reverse each word
//! - `sentinel`: recognise the end-of-session token

pub mod reverse;
pub mod sentinel;
pub mod transmogrify;
