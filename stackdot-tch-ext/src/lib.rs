//! Variable store paths with parameter groups.
//!
//! `tch` assigns every variable to a parameter group, so that an
//! optimizer can use different hyper-parameters per group. The
//! [`PathExt`] type in this crate decides the group of a variable from
//! its fully-qualified name when the variable is created. This makes it
//! possible to, for instance, train pretrained embeddings with a smaller
//! learning rate than freshly-initialized recurrent weights.

use std::ops::Div;
use std::rc::Rc;

use itertools::Itertools;
use tch::nn::{Init, Path, VarStore};
use tch::{TchError, Tensor};

/// Trait that provides the root of a variable store.
pub trait RootExt {
    /// Get the root of a variable store.
    ///
    /// `parameter_group_fun` maps the fully-qualified name of each
    /// variable (components separated by `.`) to its parameter group.
    fn root_ext<F>(&self, parameter_group_fun: F) -> PathExt
    where
        F: 'static + Fn(&str) -> usize;
}

impl RootExt for VarStore {
    fn root_ext<F>(&self, parameter_group_fun: F) -> PathExt
    where
        F: 'static + Fn(&str) -> usize,
    {
        PathExt {
            inner: self.root(),
            parameter_group_fun: Rc::new(parameter_group_fun),
        }
    }
}

/// Variable store path that assigns variables to parameter groups.
pub struct PathExt<'a> {
    inner: Path<'a>,
    parameter_group_fun: Rc<dyn Fn(&str) -> usize>,
}

impl<'a> PathExt<'a> {
    /// Get a sub-path of the current path.
    pub fn sub<T: ToString>(&'a self, s: T) -> PathExt<'a> {
        PathExt {
            inner: self.inner.sub(s),
            parameter_group_fun: self.parameter_group_fun.clone(),
        }
    }

    /// The device on which variables of this path are placed.
    pub fn device(&self) -> tch::Device {
        self.inner.device()
    }

    /// Create a tensor variable initialized with the given initializer.
    pub fn var(&self, name: &str, dims: &[i64], init: Init) -> Result<Tensor, TchError> {
        self.grouped(name).f_var(name, dims, init)
    }

    /// Create a tensor variable initialized with the values from another tensor.
    ///
    /// The variable is placed on the device of the variable store,
    /// regardless of the device of `t`.
    pub fn var_copy(&self, name: &str, t: &Tensor) -> Result<Tensor, TchError> {
        self.grouped(name).f_var_copy(name, t)
    }

    /// Get the fully-qualified name of a variable in this path.
    pub fn full_name(&self, name: &str) -> String {
        self.inner
            .components()
            .chain(std::iter::once(name))
            .filter(|component| !component.is_empty())
            .join(".")
    }

    fn grouped(&self, name: &str) -> Path<'a> {
        let group = (self.parameter_group_fun)(&self.full_name(name));
        self.inner.set_group(group)
    }
}

impl<'a, T> Div<T> for &'a mut PathExt<'a>
where
    T: std::string::ToString,
{
    type Output = PathExt<'a>;

    fn div(self, rhs: T) -> Self::Output {
        self.sub(rhs.to_string())
    }
}

impl<'a, T> Div<T> for &'a PathExt<'a>
where
    T: std::string::ToString,
{
    type Output = PathExt<'a>;

    fn div(self, rhs: T) -> Self::Output {
        self.sub(rhs.to_string())
    }
}
