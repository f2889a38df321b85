/*!
# sysmon DevKit - test tooling for the hub

- `engine_stub`: a fake metrics engine speaking the line protocol over real TCP
- `test_utils`: protocol line builders and async wait helpers
*/

pub mod engine_stub;
pub mod test_utils;

pub use engine_stub::FakeEngine;
