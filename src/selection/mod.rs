//! Machine type and location fallback.
//!
//! [`Selector::select`] walks a prioritised list of machine types and, for
//! each one, the locations where it is currently available, ordered so the
//! operator's preferred locations come first. Each `(type, location)` pair is
//! handed to an attempt callback (normally "create the first server there").
//! Capacity failures move on to the next pair; any other failure stops the
//! search immediately. When every pair fails for capacity reasons one
//! aggregated [`SelectionError::Exhausted`] is returned.

mod classify;

use std::fmt;
use std::future::Future;

use thiserror::Error;
use tracing::{debug, warn};

use crate::interrupt::{CallGuard, Interrupted};
use crate::provider::MachineProvider;

pub use classify::is_capacity_error;

/// Machine types and locations to try, in priority order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SelectionRequest {
    machine_types: Vec<String>,
    preferred_locations: Vec<String>,
    preferred_only: bool,
}

impl SelectionRequest {
    /// Starts a request for the given primary machine type.
    #[must_use]
    pub fn new(primary: impl Into<String>) -> Self {
        let mut request = Self::default();
        request.push_machine_type(primary.into());
        request
    }

    /// Request pinned to a single machine type and location.
    #[must_use]
    pub fn fixed(machine_type: impl Into<String>, location: impl Into<String>) -> Self {
        let mut request = Self::new(machine_type).with_preferred_locations([location]);
        request.preferred_only = true;
        request
    }

    /// Appends fallback machine types, skipping blanks and duplicates.
    #[must_use]
    pub fn with_fallbacks<I, S>(mut self, fallbacks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for fallback in fallbacks {
            self.push_machine_type(fallback.into());
        }
        self
    }

    /// Appends preferred locations, skipping blanks and duplicates.
    #[must_use]
    pub fn with_preferred_locations<I, S>(mut self, locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for location in locations {
            let location = location.into().trim().to_owned();
            if !location.is_empty() && !self.preferred_locations.contains(&location) {
                self.preferred_locations.push(location);
            }
        }
        self
    }

    /// Restricts attempts to the preferred locations.
    #[must_use]
    pub const fn preferred_only(mut self) -> Self {
        self.preferred_only = true;
        self
    }

    fn push_machine_type(&mut self, machine_type: String) {
        let machine_type = machine_type.trim().to_owned();
        if !machine_type.is_empty() && !self.machine_types.contains(&machine_type) {
            self.machine_types.push(machine_type);
        }
    }

    /// Machine types in priority order, primary first.
    #[must_use]
    pub fn machine_types(&self) -> &[String] {
        &self.machine_types
    }

    /// Preferred locations in priority order.
    #[must_use]
    pub fn preferred_locations(&self) -> &[String] {
        &self.preferred_locations
    }

    /// Returns true when only the preferred locations may be attempted.
    #[must_use]
    pub const fn is_preferred_only(&self) -> bool {
        self.preferred_only
    }
}

/// A concrete machine type and location pair.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Placement {
    /// Machine type.
    pub machine_type: String,
    /// Location.
    pub location: String,
}

impl Placement {
    /// Creates a placement.
    #[must_use]
    pub fn new(machine_type: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            machine_type: machine_type.into(),
            location: location.into(),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in {}", self.machine_type, self.location)
    }
}

/// Result of a successful selection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Selected<T> {
    /// Placement that accepted the attempt.
    pub placement: Placement,
    /// Value produced by the successful attempt.
    pub value: T,
    /// Number of pairs attempted, including the successful one.
    pub attempts: usize,
}

/// Errors raised while selecting a placement.
#[derive(Debug, Error)]
pub enum SelectionError<E>
where
    E: std::error::Error + 'static,
{
    /// Raised when none of the requested machine types exist.
    #[error(
        "none of the requested machine types exist in the provider catalogue: {}",
        .candidates.join(", ")
    )]
    NoValidMachineType {
        /// Machine types that were requested.
        candidates: Vec<String>,
    },
    /// Raised when a catalogue or availability query fails.
    #[error("failed to query the provider for {machine_type}: {source}")]
    Provider {
        /// Machine type being queried.
        machine_type: String,
        /// Provider error.
        source: E,
    },
    /// Raised when an attempt fails for a reason other than capacity.
    #[error("provisioning {placement} failed: {source}")]
    Fatal {
        /// Placement that was attempted.
        placement: Placement,
        /// Provider error.
        source: E,
    },
    /// Raised when a provider call was cancelled or timed out.
    #[error("selection interrupted: {reason}")]
    Interrupted {
        /// Placement being attempted, if any.
        placement: Option<Placement>,
        /// Cancellation or timeout.
        reason: Interrupted,
    },
    /// Raised when every pair failed for capacity reasons.
    #[error(
        "no capacity after {attempts} attempt(s) across machine types [{}] and locations [{}]; \
         add fallback machine types or preferred zones{}",
        .machine_types.join(", "),
        .locations.join(", "),
        .last_error.as_ref().map(|err| format!(" (last error: {err})")).unwrap_or_default()
    )]
    Exhausted {
        /// Number of pairs attempted.
        attempts: usize,
        /// Machine types that were considered.
        machine_types: Vec<String>,
        /// Locations that were considered.
        locations: Vec<String>,
        /// Text of the final capacity error, if any attempt was made.
        last_error: Option<String>,
    },
}

/// Orders `available` so members of `preferred` come first in preferred
/// order, followed by the remaining available locations in their original
/// order.
///
/// Preferred locations that are not available are dropped.
#[must_use]
pub fn order_locations(available: &[String], preferred: &[String]) -> Vec<String> {
    let mut ordered: Vec<String> = Vec::with_capacity(available.len());
    for location in preferred {
        if available.contains(location) && !ordered.contains(location) {
            ordered.push(location.clone());
        }
    }
    for location in available {
        if !preferred.contains(location) && !ordered.contains(location) {
            ordered.push(location.clone());
        }
    }
    ordered
}

/// Runs the fallback search against one provider.
#[derive(Debug)]
pub struct Selector<'a, P: ?Sized> {
    provider: &'a P,
    guard: &'a CallGuard,
}

impl<'a, P> Selector<'a, P>
where
    P: MachineProvider + ?Sized,
{
    /// Creates a selector whose provider calls are bounded by `guard`.
    #[must_use]
    pub const fn new(provider: &'a P, guard: &'a CallGuard) -> Self {
        Self { provider, guard }
    }

    async fn guarded<T, F>(
        &self,
        placement: Option<&Placement>,
        call: F,
    ) -> Result<T, SelectionError<P::Error>>
    where
        F: Future<Output = T>,
    {
        self.guard
            .run(call)
            .await
            .map_err(|reason| SelectionError::Interrupted {
                placement: placement.cloned(),
                reason,
            })
    }

    /// Returns the requested machine types that exist in the catalogue.
    ///
    /// Unknown types are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::NoValidMachineType`] when nothing survives,
    /// and [`SelectionError::Provider`] when the catalogue cannot be queried.
    pub async fn viable_machine_types(
        &self,
        request: &SelectionRequest,
    ) -> Result<Vec<String>, SelectionError<P::Error>> {
        let mut viable = Vec::with_capacity(request.machine_types().len());
        for machine_type in request.machine_types() {
            let exists = self
                .guarded(None, self.provider.validate_server_type(machine_type))
                .await?
                .map_err(|source| SelectionError::Provider {
                    machine_type: machine_type.clone(),
                    source,
                })?;
            if exists {
                viable.push(machine_type.clone());
            } else {
                warn!(machine_type = %machine_type, "discarding unknown machine type");
            }
        }
        if viable.is_empty() {
            return Err(SelectionError::NoValidMachineType {
                candidates: request.machine_types().to_vec(),
            });
        }
        Ok(viable)
    }

    async fn locations_for(
        &self,
        machine_type: &str,
        request: &SelectionRequest,
    ) -> Result<Vec<String>, SelectionError<P::Error>> {
        if request.is_preferred_only() {
            return Ok(request.preferred_locations().to_vec());
        }
        let available = match self
            .guarded(None, self.provider.available_locations(machine_type))
            .await?
        {
            Ok(available) => available,
            Err(err) if is_capacity_error(&err.to_string()) => {
                warn!(machine_type, error = %err, "machine type has no capacity anywhere");
                Vec::new()
            }
            Err(source) => {
                return Err(SelectionError::Provider {
                    machine_type: machine_type.to_owned(),
                    source,
                });
            }
        };
        Ok(order_locations(&available, request.preferred_locations()))
    }

    /// Finds the first placement at which `attempt` succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::Fatal`] for the first non-capacity failure,
    /// [`SelectionError::Interrupted`] on cancellation or timeout, and
    /// [`SelectionError::Exhausted`] when every pair ran out of capacity.
    pub async fn select<T, F, Fut>(
        &self,
        request: &SelectionRequest,
        mut attempt: F,
    ) -> Result<Selected<T>, SelectionError<P::Error>>
    where
        F: FnMut(&Placement) -> Fut,
        Fut: Future<Output = Result<T, P::Error>>,
    {
        let machine_types = self.viable_machine_types(request).await?;
        let mut attempts = 0_usize;
        let mut seen_locations: Vec<String> = Vec::new();
        let mut last_error = None;

        for machine_type in &machine_types {
            let locations = self.locations_for(machine_type, request).await?;
            for location in locations {
                if !seen_locations.contains(&location) {
                    seen_locations.push(location.clone());
                }
                let placement = Placement::new(machine_type.clone(), location);
                attempts += 1;
                debug!(
                    machine_type = %placement.machine_type,
                    location = %placement.location,
                    attempt = attempts,
                    "attempting placement"
                );
                match self.guarded(Some(&placement), attempt(&placement)).await? {
                    Ok(value) => {
                        return Ok(Selected {
                            placement,
                            value,
                            attempts,
                        });
                    }
                    Err(err) if is_capacity_error(&err.to_string()) => {
                        warn!(
                            machine_type = %placement.machine_type,
                            location = %placement.location,
                            error = %err,
                            "placement out of capacity; trying the next one"
                        );
                        last_error = Some(err.to_string());
                    }
                    Err(source) => return Err(SelectionError::Fatal { placement, source }),
                }
            }
        }

        Err(SelectionError::Exhausted {
            attempts,
            machine_types,
            locations: seen_locations,
            last_error,
        })
    }
}
