// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage engine: container file + chunk index + filter pipeline.

pub mod access;
pub mod container;
pub mod dataset;
pub mod filters;
pub mod index;
pub mod layout;
