#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

//! Entry-point attribute macros for the polliwog runtime.

mod entry;

/// Marks an async function to be executed by the selected runtime. This
/// macro sets up a `Runtime` without requiring the user to touch `Runtime`
/// or `Builder` directly.
///
/// # Runtime flavors
///
/// The `flavor` parameter selects the executor; the default is the
/// work-stealing pool.
///
/// ```no_run
/// #[polliwog::main(flavor = "stealing", worker_threads = 4)]
/// async fn main() {
///     println!("hello");
/// }
/// ```
///
/// Equivalent code not using `#[polliwog::main]`:
///
/// ```no_run
/// fn main() {
///     polliwog::runtime::Builder::new_stealing()
///         .worker_threads(4)
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             println!("hello");
///         })
/// }
/// ```
///
/// The single-threaded cooperative executor is selected with
/// `flavor = "inline"`; it accepts no `worker_threads` option.
#[proc_macro_attribute]
pub fn main(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::main(args.into(), item.into()).into()
}

/// Marks an async function to be executed by the runtime, suitable for test
/// environments. Each test gets its own runtime; the default flavor for
/// tests is `inline`.
///
/// ```no_run
/// #[polliwog::test]
/// async fn my_test() {
///     assert!(true);
/// }
/// ```
///
/// Equivalent code not using `#[polliwog::test]`:
///
/// ```no_run
/// #[test]
/// fn my_test() {
///     polliwog::runtime::Builder::new_inline()
///         .try_build()
///         .unwrap()
///         .block_on(async {
///             assert!(true);
///         })
/// }
/// ```
///
/// The work-stealing pool is selected with `flavor = "stealing"`, which
/// also accepts `worker_threads = N`.
#[proc_macro_attribute]
pub fn test(
    args: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    entry::test(args.into(), item.into()).into()
}
