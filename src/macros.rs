// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

/// Shorthand for building a [`HashMap<String, Value>`] as used for auth token
/// data and routing contexts.
///
/// [`HashMap<String, Value>`]: std::collections::HashMap
///
/// # Example
/// ```
/// use graphbolt::{value_map, Value};
///
/// let map = value_map!({
///     "scheme": "basic",
///     "principal": "alice",
/// });
/// assert_eq!(map.get("scheme"), Some(&Value::String(String::from("basic"))));
/// ```
#[macro_export]
macro_rules! value_map {
    () => {
        std::collections::HashMap::<String, $crate::Value>::new()
    };
    ({$($key:literal : $value:expr),* $(,)?}) => {
        {
            #[allow(unused_mut)]
            let mut map = std::collections::HashMap::<String, $crate::Value>::new();
            $(map.insert(String::from($key), $crate::Value::from($value));)*
            map
        }
    };
}
