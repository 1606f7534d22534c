//! End-to-end tests for qatfuse live in `tests/`.
