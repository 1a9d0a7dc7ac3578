//! Hostbind Proc Macros
//!
//! `#[derive(HostType)]` turns a plain struct into a class the scripting
//! runtime can hold.
//!
//! # Example
//!
//! ```ignore
//! use hostbind::HostType;
//!
//! #[derive(HostType)]
//! #[host(name = "Player")]
//! pub struct Player {
//!     #[host(get, set)]
//!     pub health: i32,
//! }
//! ```

use proc_macro::TokenStream;

mod attrs;
mod derive_host_type;

/// Derive `HostType` and `ToStack` for a struct.
///
/// # Attributes
///
/// - `#[host(name = "...")]` - Override the class name seen by scripts
///
/// # Field Attributes
///
/// - `#[host(get)]` - Expose a read-only property (the field type must be `Clone`)
/// - `#[host(get, set)]` - Expose a read-write property
/// - `#[host(name = "...")]` - Override the property name
///
/// # Example
///
/// ```ignore
/// #[derive(HostType)]
/// pub struct Account {
///     #[host(get)]
///     pub id: u32,
///
///     #[host(get, set, name = "balance")]
///     pub cents: i64,
/// }
/// ```
#[proc_macro_derive(HostType, attributes(host))]
pub fn derive_host_type(input: TokenStream) -> TokenStream {
    derive_host_type::derive_host_type_impl(input)
}
