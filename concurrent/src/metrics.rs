// Copyright (C) 2025 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of concurrent.
//
// concurrent is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// concurrent is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with concurrent.  If not,
// see <http://www.gnu.org/licenses/>.

//! # concurrent metrics
//!
//! concurrent collects metrics through [OpenTelemetry]. OTel asks that instruments be created once
//! & re-used, which raises the question of where to keep them. Rather than hang a field of type
//! `Counter<u64>` off the application state for every metric, each module declares the metrics it
//! emits next to the code that emits them:
//!
//! ```ignore
//! inventory::submit! { metrics::Registration::new("timeline.recent.reads", Sort::IntegralCounter) }
//! // ...
//! counter_add!(state.instruments, "timeline.recent.reads", 1, &[]);
//! ```
//!
//! [inventory] gathers the registrations at link time; [Instruments::new] builds every registered
//! instrument up-front (so that recording doesn't require `&mut self`, and an [Instruments] can
//! live in an `Arc`) and refuses to start if two modules claim the same name.
//!
//! Looking-up a name that was never registered, or recording to a counter as though it were a
//! gauge, is a logic error & panics.
//!
//! [OpenTelemetry]: https://docs.rs/opentelemetry/latest/opentelemetry/index.html

use std::collections::{hash_map::Entry, HashMap, HashSet};

use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Meter},
    KeyValue,
};

/// Instrument type
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Sort {
    /// `Counter<u64>`
    IntegralCounter,
    /// `Gauge<f64>`
    FloatGauge,
    /// `Gauge<u64>`
    IntegralGauge,
}

/// A metric name & its instrument type, as collected by [inventory]
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Registration {
    name: &'static str,
    sort: Sort,
}

impl Registration {
    pub const fn new(name: &'static str, sort: Sort) -> Registration {
        Registration { name, sort }
    }
    pub fn name(&self) -> &'static str {
        self.name
    }
    pub fn sort(&self) -> Sort {
        self.sort
    }
}

inventory::collect!(Registration);

/// Panic if any metric name has been registered twice; call this early in process startup
pub fn check_metric_names() {
    let mut names: HashSet<&'static str> = HashSet::new();
    for reg in inventory::iter::<Registration> {
        if !names.insert(reg.name()) {
            panic!("The metric name {} was registered twice", reg.name());
        }
    }
}

enum Instrument {
    CounterU64(Counter<u64>),
    GaugeF64(Gauge<f64>),
    GaugeU64(Gauge<u64>),
}

/// Container for OTel instruments
pub struct Instruments {
    meter: Meter,
    map: HashMap<&'static str, Instrument>,
}

impl Instruments {
    pub fn new(prefix: &'static str) -> Instruments {
        let meter = global::meter(prefix);
        let mut map: HashMap<&'static str, Instrument> = HashMap::new();
        for reg in inventory::iter::<Registration> {
            match map.entry(reg.name()) {
                Entry::Occupied(_) => panic!("The metric name {} was used twice", reg.name()),
                Entry::Vacant(vacant) => {
                    vacant.insert(match reg.sort() {
                        Sort::IntegralCounter => {
                            Instrument::CounterU64(meter.u64_counter(reg.name()).build())
                        }
                        Sort::FloatGauge => {
                            Instrument::GaugeF64(meter.f64_gauge(reg.name()).build())
                        }
                        Sort::IntegralGauge => {
                            Instrument::GaugeU64(meter.u64_gauge(reg.name()).build())
                        }
                    });
                }
            }
        }
        Instruments { meter, map }
    }
    pub fn meter(&self) -> &Meter {
        &self.meter
    }
    /// Return true if `name` has been registered
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }
    // panics if `name` doesn't name a counter
    pub fn add(&self, name: &str, count: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::CounterU64(c)) => c.add(count, attributes),
            _ => panic!("{} does not name a counter", name),
        }
    }
    pub fn recordf(&self, name: &str, value: f64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeF64(g)) => g.record(value, attributes),
            _ => panic!("{} does not name a float gauge", name),
        }
    }
    pub fn recordu(&self, name: &str, value: u64, attributes: &[KeyValue]) {
        match self.map.get(name) {
            Some(Instrument::GaugeU64(g)) => g.record(value, attributes),
            _ => panic!("{} does not name an integral gauge", name),
        }
    }
}

#[macro_export]
macro_rules! counter_add {
    ($instr:expr, $name:expr, $count:expr, $attrs:expr) => {
        $instr.add($name, $count, $attrs);
    };
}

#[macro_export]
macro_rules! gauge_setu {
    ($instr:expr, $name:expr, $value:expr, $attrs:expr) => {
        $instr.recordu($name, $value, $attrs);
    };
}
