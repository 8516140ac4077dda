/*
 * Copyright (C) 2024 The Nanochaos Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::error::Error;
use std::fmt;

#[derive(Debug)]
struct ContextError {
    context: String,
    source: Box<dyn Error + Send + Sync>,
}

impl ContextError {
    fn new(context: impl Into<String>, source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            context: context.into(),
            source: source.into(),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.source)
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.source.as_ref())
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl SimpleError {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for SimpleError {}

pub fn with_context<E>(error: E, context: impl Into<String>) -> Box<dyn Error + Send + Sync>
where
    E: Into<Box<dyn Error + Send + Sync>>,
{
    Box::new(ContextError::new(context, error))
}

pub fn new_error(message: impl Into<String>) -> Box<dyn Error + Send + Sync> {
    Box::new(SimpleError::new(message))
}

/// Accumulates per-target errors during Recover. Apply is first-error-wins,
/// Recover keeps going so a single bad target cannot block the cleanup of
/// the rest.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<Box<dyn Error + Send + Sync>>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, error: Box<dyn Error + Send + Sync>) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Resolves the accumulation: Ok when no error was recorded.
    pub fn into_result(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(Box::new(AggregateError {
            errors: self.errors,
        }))
    }
}

#[derive(Debug)]
struct AggregateError {
    errors: Vec<Box<dyn Error + Send + Sync>>,
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for error in &self.errors {
            write!(f, " [{}]", error)?;
        }
        Ok(())
    }
}

impl Error for AggregateError {}

/// Returns true when an error came from a lost optimistic-concurrency race
/// on the object store; callers retry those with a fresh read.
pub fn is_conflict_error(err: &dyn Error) -> bool {
    err.to_string().contains("version conflict")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_list_aggregates_messages() {
        let mut list = ErrorList::new();
        assert!(list.is_empty());
        list.push(new_error("tc command failed"));
        list.push(with_context(new_error("no such container"), "pod default/web-0"));
        let err = list.into_result().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("2 error(s)"), "{message}");
        assert!(message.contains("tc command failed"), "{message}");
        assert!(message.contains("pod default/web-0"), "{message}");
    }

    #[test]
    fn empty_error_list_is_ok() {
        assert!(ErrorList::new().into_result().is_ok());
    }

    #[test]
    fn conflict_errors_are_detected_through_context() {
        let err = with_context(new_error("version conflict on /pods/default/web-0"), "update pod");
        assert!(is_conflict_error(err.as_ref()));
        assert!(!is_conflict_error(new_error("not found").as_ref()));
    }
}
