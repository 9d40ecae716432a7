//! Integration tests for the execution host


mod host_lifecycle;
mod interactive;
mod nested_frames;
mod queue_ordering;
