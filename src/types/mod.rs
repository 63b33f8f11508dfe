/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the types the membership and multicast protocols work with.

pub mod data_types;

pub mod node;

pub mod view;
