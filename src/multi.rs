//! Argument and result lists for calls from Rust into the runtime.

use hostbind_core::State;

use crate::convert::{FromStack, ToStack};
use crate::error::BindError;

/// Values pushed as the arguments of a call.
pub trait IntoArgs {
    /// Push the arguments and report how many were pushed.
    fn push_args(self, state: &mut State) -> Result<i32, BindError>;
}

impl IntoArgs for () {
    fn push_args(self, _state: &mut State) -> Result<i32, BindError> {
        Ok(0)
    }
}

impl<T: ToStack> IntoArgs for T {
    fn push_args(self, state: &mut State) -> Result<i32, BindError> {
        self.to_stack(state)?;
        Ok(1)
    }
}

/// Values read back from the results of a call.
pub trait FromResults: Sized {
    /// Number of results requested from the call.
    const COUNT: i32;

    /// Read the results starting at stack index `first`.
    fn from_results(state: &mut State, first: i32) -> Result<Self, BindError>;
}

impl FromResults for () {
    const COUNT: i32 = 0;

    fn from_results(_state: &mut State, _first: i32) -> Result<Self, BindError> {
        Ok(())
    }
}

fn read<T: FromStack>(state: &mut State, index: i32) -> Result<T, BindError> {
    if !T::check(state, index) {
        return Err(T::mismatch(state, index));
    }
    T::from_stack(state, index)
}

impl<T: FromStack> FromResults for T {
    const COUNT: i32 = 1;

    fn from_results(state: &mut State, first: i32) -> Result<Self, BindError> {
        read(state, first)
    }
}

macro_rules! impl_multi_tuple {
    ($count:literal; $($name:ident => $offset:literal),+) => {
        impl<$($name: ToStack),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn push_args(self, state: &mut State) -> Result<i32, BindError> {
                let ($($name,)+) = self;
                $($name.to_stack(state)?;)+
                Ok($count)
            }
        }

        impl<$($name: FromStack),+> FromResults for ($($name,)+) {
            const COUNT: i32 = $count;

            fn from_results(state: &mut State, first: i32) -> Result<Self, BindError> {
                Ok(($(read::<$name>(state, first + $offset)?,)+))
            }
        }
    };
}

impl_multi_tuple!(1; A => 0);
impl_multi_tuple!(2; A => 0, B => 1);
impl_multi_tuple!(3; A => 0, B => 1, C => 2);
impl_multi_tuple!(4; A => 0, B => 1, C => 2, D => 3);
impl_multi_tuple!(5; A => 0, B => 1, C => 2, D => 3, E => 4);
impl_multi_tuple!(6; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5);
impl_multi_tuple!(7; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6);
impl_multi_tuple!(8; A => 0, B => 1, C => 2, D => 3, E => 4, F => 5, G => 6, H => 7);

#[cfg(test)]
mod tests {
    use super::*;
    use hostbind_core::Value;

    #[test]
    fn tuples_push_in_order() {
        let mut state = State::new();
        assert_eq!((1_i32, "two", 3.0_f64).push_args(&mut state).unwrap(), 3);
        assert_eq!(state.value(1), Value::Int(1));
        assert_eq!(state.value(2), Value::from("two"));
        assert_eq!(state.value(3), Value::Float(3.0));
        assert_eq!(().push_args(&mut state).unwrap(), 0);
        assert_eq!(7_i64.push_args(&mut state).unwrap(), 1);
    }

    #[test]
    fn results_read_from_first_index() {
        let mut state = State::new();
        state.push_str("skip");
        state.push_int(4);
        state.push_bool(true);
        let (n, flag): (i64, bool) = FromResults::from_results(&mut state, 2).unwrap();
        assert_eq!((n, flag), (4, true));
        let single: i64 = FromResults::from_results(&mut state, 2).unwrap();
        assert_eq!(single, 4);
        assert!(<(i64, i64)>::from_results(&mut state, 2).is_err());
    }
}
