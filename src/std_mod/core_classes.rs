use std::cell::Cell;
use std::cmp::Ordering;
use std::rc::Rc;

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;

use crate::constants::{
    CLASS_BOOL, CLASS_FLOAT, CLASS_INT, CLASS_LIST, CLASS_OBJECT, CLASS_RANGE, CLASS_STR, FIELD_MAX, FIELD_MIN, HAS, INIT,
    ITERATE, NEXT,
};
use crate::objects::object::{NativeFnPtr, NativeObject};
use crate::objects::object_class::{ClassKind, ObjectClass};
use crate::objects::object_manager::{ClassId, ObjectManager};
use crate::objects::object_native_function::ObjectNativeFunction;
use crate::std_mod::{arg, define_natives, int_arg, str_arg};
use crate::value::{is_false, is_nil, make_str_value, Value};
use crate::vm::VM;

static FORMAT_PLACEHOLDER: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\{(\d+)\}").ok());

/// Ids of the built-in classes primitives and literals are boxed into.
#[derive(Debug, Clone, Copy)]
pub struct CoreClasses {
    pub bool_class: ClassId,
    pub int: ClassId,
    pub float: ClassId,
    pub str_class: ClassId,
    pub object: ClassId,
    pub list: ClassId,
    pub range: ClassId,
}

const INT_NATIVES: &[(&str, usize, NativeFnPtr)] = &[("times", 0, int_times), ("min", 0, int_min), ("max", 0, int_max)];

const FLOAT_NATIVES: &[(&str, usize, NativeFnPtr)] = &[("min", 0, float_min), ("max", 0, float_max)];

const STR_NATIVES: &[(&str, usize, NativeFnPtr)] = &[
    ("length", 0, str_length),
    (HAS, 1, str_has),
    (ITERATE, 0, str_iterate),
    ("format", 1, str_format),
    ("isEmpty", 0, str_is_empty),
    ("startsWith", 1, str_starts_with),
    ("endsWith", 1, str_ends_with),
    ("lowercased", 0, str_lowercased),
    ("uppercased", 0, str_uppercased),
];

const OBJECT_NATIVES: &[(&str, usize, NativeFnPtr)] = &[("keys", 0, object_keys)];

const LIST_NATIVES: &[(&str, usize, NativeFnPtr)] = &[
    ("size", 0, list_size),
    ("isEmpty", 0, list_is_empty),
    (HAS, 1, list_has),
    (ITERATE, 0, list_iterate),
    ("add", 1, list_add),
    ("addAll", 1, list_add_all),
    ("insert", 2, list_insert),
    ("removeAt", 1, list_remove_at),
    ("clear", 0, list_clear),
    ("indexOf", 1, list_index_of),
    ("lastIndexOf", 1, list_last_index_of),
    ("sublist", 2, list_sublist),
    ("take", 1, list_take),
    ("where", 1, list_where),
    ("count", 1, list_count),
    ("any", 1, list_any),
    ("all", 1, list_all),
    ("map", 1, list_map),
    ("mapToObject", 2, list_map_to_object),
    ("compactMap", 0, list_compact_map),
    ("reduce", 2, list_reduce),
    ("groupBy", 1, list_group_by),
    ("sortedBy", 1, list_sorted_by),
    ("reversed", 0, list_reversed),
    ("shuffled", 0, list_shuffled),
    ("unique", 0, list_unique),
    ("randomItem", 0, list_random_item),
    ("join", 1, list_join),
    ("minBy", 1, list_min_by),
    ("maxBy", 1, list_max_by),
];

const RANGE_NATIVES: &[(&str, usize, NativeFnPtr)] =
    &[(INIT, 2, range_init), (HAS, 1, range_has), (ITERATE, 0, range_iterate)];

fn core_class(heap: &mut ObjectManager, name: &str, natives: &[(&str, usize, NativeFnPtr)]) -> ClassId {
    let mut class = ObjectClass::new(name, ClassKind::Core);
    define_natives(&mut class.fields, natives);
    heap.alloc_class(class)
}

pub fn register(heap: &mut ObjectManager) -> CoreClasses {
    let classes = CoreClasses {
        bool_class: core_class(heap, CLASS_BOOL, &[]),
        int: core_class(heap, CLASS_INT, INT_NATIVES),
        float: core_class(heap, CLASS_FLOAT, FLOAT_NATIVES),
        str_class: core_class(heap, CLASS_STR, STR_NATIVES),
        object: core_class(heap, CLASS_OBJECT, OBJECT_NATIVES),
        list: core_class(heap, CLASS_LIST, LIST_NATIVES),
        range: core_class(heap, CLASS_RANGE, RANGE_NATIVES),
    };
    // first/last take an optional predicate.
    let list = heap.class_mut(classes.list);
    for (name, function) in [("first", list_first as NativeFnPtr), ("last", list_last as NativeFnPtr)] {
        let native = ObjectNativeFunction::from_fn(name, 1, function).with_defaults(0, vec![Value::Nil]);
        list.fields.insert(Rc::from(name), Value::Native(Rc::new(native)));
    }
    classes
}

/// Hands out the items of a list snapshot one by one.
struct ListIterator {
    list: Value,
    index: Cell<usize>,
}

impl NativeObject for ListIterator {
    fn run(&self, vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
        let index = self.index.get();
        match vm.list_items(&self.list).and_then(|items| items.get(index)) {
            Some(item) => {
                self.index.set(index + 1);
                Ok(item.clone())
            }
            None => Ok(Value::Nil),
        }
    }
}

struct RangeIterator {
    // `None` once the range is exhausted.
    current: Cell<Option<i64>>,
    max: i64,
}

impl NativeObject for RangeIterator {
    fn run(&self, _vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
        match self.current.get() {
            Some(current) if current <= self.max => {
                self.current.set(current.checked_add(1));
                Ok(Value::Int(current))
            }
            _ => Ok(Value::Nil),
        }
    }
}

fn iterator(vm: &mut VM, next: impl NativeObject + 'static) -> Value {
    let next = Value::Native(Rc::new(ObjectNativeFunction::new(NEXT, 0, next)));
    vm.new_object(vec![(Rc::from(NEXT), next)])
}

fn list_iterator(vm: &mut VM, list: Value) -> Value {
    iterator(vm, ListIterator { list, index: Cell::new(0) })
}

fn int_times(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let count = int_arg(args, 0, "times")?;
    Ok(vm.new_range(0, count.saturating_sub(1).max(-1)))
}

fn int_min(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Int(i64::MIN))
}

fn int_max(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Int(i64::MAX))
}

fn float_min(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(f64::MIN))
}

fn float_max(_vm: &mut VM, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Float(f64::MAX))
}

fn str_length(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let s = str_arg(args, 0, "length")?;
    Ok(Value::Int(s.chars().count() as i64))
}

fn str_has(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let s = str_arg(args, 0, HAS)?;
    let other = str_arg(args, 1, HAS)?;
    Ok(Value::Bool(s.contains(other.as_ref())))
}

fn str_iterate(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let s = str_arg(args, 0, ITERATE)?;
    let chars = s.chars().map(|c| make_str_value(&c.to_string())).collect();
    let list = vm.new_list(chars);
    Ok(list_iterator(vm, list))
}

/// Replaces `{N}` placeholders with the stringified N-th list item.
fn str_format(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let template = str_arg(args, 0, "format")?;
    let items = list_snapshot(vm, &arg(args, 1))?;
    let placeholder = FORMAT_PLACEHOLDER.as_ref().ok_or("Invalid format placeholder pattern.")?;
    let mut missing = None;
    let formatted = placeholder.replace_all(&template, |captures: &regex::Captures| {
        let index: usize = captures[1].parse().unwrap_or(usize::MAX);
        match items.get(index) {
            Some(item) => vm.stringify(item),
            None => {
                missing.get_or_insert(index);
                String::new()
            }
        }
    });
    match missing {
        Some(index) => Err(format!("Illegal argument error, index: {}, size: {}", index, items.len())),
        None => Ok(make_str_value(&formatted)),
    }
}

fn str_is_empty(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(str_arg(args, 0, "isEmpty")?.is_empty()))
}

fn str_starts_with(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let s = str_arg(args, 0, "startsWith")?;
    Ok(Value::Bool(s.starts_with(str_arg(args, 1, "startsWith")?.as_ref())))
}

fn str_ends_with(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let s = str_arg(args, 0, "endsWith")?;
    Ok(Value::Bool(s.ends_with(str_arg(args, 1, "endsWith")?.as_ref())))
}

fn str_lowercased(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(make_str_value(&str_arg(args, 0, "lowercased")?.to_lowercase()))
}

fn str_uppercased(_vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(make_str_value(&str_arg(args, 0, "uppercased")?.to_uppercase()))
}

fn object_keys(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let keys = match &args[0] {
        Value::Instance(id) => vm.heap().instance(*id).fields.keys().map(|key| Value::Str(Rc::clone(key))).collect(),
        _ => Vec::new(),
    };
    Ok(vm.new_list(keys))
}

fn list_snapshot(vm: &VM, list: &Value) -> Result<Vec<Value>, String> {
    vm.list_items(list).cloned().ok_or_else(|| "Expected a List.".to_string())
}

fn list_items_mut<'a>(vm: &'a mut VM, list: &Value) -> Result<&'a mut Vec<Value>, String> {
    vm.list_items_mut(list).ok_or_else(|| "Expected a List.".to_string())
}

fn index_arg(args: &[Value], index: usize, len: usize, inclusive: bool) -> Result<usize, String> {
    let value = int_arg(args, index, "index")?;
    let limit = if inclusive { len + 1 } else { len };
    if value >= 0 && (value as usize) < limit {
        Ok(value as usize)
    } else {
        Err(format!("Illegal argument error, index: {value}, size: {len}"))
    }
}

fn is_true(value: &Value) -> bool {
    !is_false(value)
}

fn list_size(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Int(list_snapshot(vm, &args[0])?.len() as i64))
}

fn list_is_empty(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(Value::Bool(vm.list_items(&args[0]).map_or(true, Vec::is_empty)))
}

fn list_has(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 1);
    let items = list_snapshot(vm, &args[0])?;
    Ok(Value::Bool(items.iter().any(|item| vm.values_equal(item, &needle))))
}

fn list_iterate(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    Ok(list_iterator(vm, args[0].clone()))
}

fn list_add(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    list_items_mut(vm, &args[0])?.push(arg(args, 1));
    Ok(args[0].clone())
}

fn list_add_all(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let other = list_snapshot(vm, &arg(args, 1))?;
    list_items_mut(vm, &args[0])?.extend(other);
    Ok(args[0].clone())
}

fn list_insert(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_items_mut(vm, &args[0])?;
    let index = index_arg(args, 2, items.len(), true)?;
    items.insert(index, arg(args, 1));
    Ok(args[0].clone())
}

fn list_remove_at(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_items_mut(vm, &args[0])?;
    let index = index_arg(args, 1, items.len(), false)?;
    items.remove(index);
    Ok(args[0].clone())
}

fn list_clear(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    list_items_mut(vm, &args[0])?.clear();
    Ok(args[0].clone())
}

fn list_index_of(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 1);
    let items = list_snapshot(vm, &args[0])?;
    Ok(items.iter().position(|item| vm.values_equal(item, &needle)).map_or(Value::Nil, |i| Value::Int(i as i64)))
}

fn list_last_index_of(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let needle = arg(args, 1);
    let items = list_snapshot(vm, &args[0])?;
    Ok(items.iter().rposition(|item| vm.values_equal(item, &needle)).map_or(Value::Nil, |i| Value::Int(i as i64)))
}

fn list_sublist(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_snapshot(vm, &args[0])?;
    let start = index_arg(args, 1, items.len(), true)?;
    let count = int_arg(args, 2, "sublist")?;
    if count < 0 || start + count as usize > items.len() {
        return Err(format!("Illegal argument error, index: {}, size: {}", start as i64 + count, items.len()));
    }
    let sublist = items[start..start + count as usize].to_vec();
    Ok(vm.new_list(sublist))
}

fn list_take(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let mut items = list_snapshot(vm, &args[0])?;
    let count = int_arg(args, 1, "take")?.max(0) as usize;
    items.truncate(count);
    Ok(vm.new_list(items))
}

fn list_where(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    let mut kept = Vec::new();
    for item in list_snapshot(vm, &args[0])? {
        if is_true(&vm.call_function(callback.clone(), &[item.clone()])?) {
            kept.push(item);
        }
    }
    Ok(vm.new_list(kept))
}

fn list_count(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    let mut count = 0;
    for item in list_snapshot(vm, &args[0])? {
        if is_true(&vm.call_function(callback.clone(), &[item])?) {
            count += 1;
        }
    }
    Ok(Value::Int(count))
}

fn list_any(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    for item in list_snapshot(vm, &args[0])? {
        if is_true(&vm.call_function(callback.clone(), &[item])?) {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn list_all(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    for item in list_snapshot(vm, &args[0])? {
        if !is_true(&vm.call_function(callback.clone(), &[item])?) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn find_match(vm: &mut VM, items: Vec<Value>, predicate: &Value) -> Result<Value, String> {
    for item in items {
        if is_nil(predicate) || is_true(&vm.call_function(predicate.clone(), &[item.clone()])?) {
            return Ok(item);
        }
    }
    Ok(Value::Nil)
}

fn list_first(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_snapshot(vm, &args[0])?;
    find_match(vm, items, &arg(args, 1))
}

fn list_last(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let mut items = list_snapshot(vm, &args[0])?;
    items.reverse();
    find_match(vm, items, &arg(args, 1))
}

fn list_map(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    let mut mapped = Vec::new();
    for item in list_snapshot(vm, &args[0])? {
        mapped.push(vm.call_function(callback.clone(), &[item])?);
    }
    Ok(vm.new_list(mapped))
}

fn key_of(vm: &VM, value: &Value) -> Rc<str> {
    match value {
        Value::Str(s) => Rc::clone(s),
        other => Rc::from(vm.stringify(other)),
    }
}

fn list_map_to_object(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let key_fn = arg(args, 1);
    let value_fn = arg(args, 2);
    let mut fields = Vec::new();
    for item in list_snapshot(vm, &args[0])? {
        let key = vm.call_function(key_fn.clone(), &[item.clone()])?;
        let value = vm.call_function(value_fn.clone(), &[item])?;
        fields.push((key_of(vm, &key), value));
    }
    Ok(vm.new_object(fields))
}

fn list_compact_map(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_snapshot(vm, &args[0])?.into_iter().filter(|item| !is_nil(item)).collect();
    Ok(vm.new_list(items))
}

fn list_reduce(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 2);
    let mut accumulator = arg(args, 1);
    for item in list_snapshot(vm, &args[0])? {
        accumulator = vm.call_function(callback.clone(), &[accumulator, item])?;
    }
    Ok(accumulator)
}

fn list_group_by(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let callback = arg(args, 1);
    let mut groups: Vec<(Rc<str>, Vec<Value>)> = Vec::new();
    for item in list_snapshot(vm, &args[0])? {
        let key = vm.call_function(callback.clone(), &[item.clone()])?;
        let key = key_of(vm, &key);
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, group)) => group.push(item),
            None => groups.push((key, vec![item])),
        }
    }
    let fields = groups.into_iter().map(|(key, group)| (key, vm.new_list(group))).collect();
    Ok(vm.new_object(fields))
}

fn compare_with(vm: &mut VM, comparator: &Value, a: &Value, b: &Value) -> Result<Ordering, String> {
    match vm.call_function(comparator.clone(), &[a.clone(), b.clone()])? {
        Value::Int(order) => Ok(order.cmp(&0)),
        Value::Float(order) => Ok(order.partial_cmp(&0.0).unwrap_or(Ordering::Equal)),
        _ => Err("sortedBy comparator must return a number.".to_string()),
    }
}

/// Stable merge sort driven by a script comparator.
fn merge_sort(vm: &mut VM, items: Vec<Value>, comparator: &Value) -> Result<Vec<Value>, String> {
    if items.len() <= 1 {
        return Ok(items);
    }
    let mut left = items;
    let right = left.split_off(left.len() / 2);
    let left = merge_sort(vm, left, comparator)?;
    let right = merge_sort(vm, right, comparator)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    while let (Some(a), Some(b)) = (left.peek(), right.peek()) {
        if compare_with(vm, comparator, a, b)? == Ordering::Greater {
            merged.extend(right.next());
        } else {
            merged.extend(left.next());
        }
    }
    merged.extend(left);
    merged.extend(right);
    Ok(merged)
}

fn list_sorted_by(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_snapshot(vm, &args[0])?;
    let sorted = merge_sort(vm, items, &arg(args, 1))?;
    Ok(vm.new_list(sorted))
}

fn list_reversed(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let mut items = list_snapshot(vm, &args[0])?;
    items.reverse();
    Ok(vm.new_list(items))
}

fn list_shuffled(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let mut items = list_snapshot(vm, &args[0])?;
    items.shuffle(&mut rand::thread_rng());
    Ok(vm.new_list(items))
}

fn list_unique(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let mut unique: Vec<Value> = Vec::new();
    for item in list_snapshot(vm, &args[0])? {
        if !unique.iter().any(|seen| vm.values_equal(seen, &item)) {
            unique.push(item);
        }
    }
    Ok(vm.new_list(unique))
}

fn list_random_item(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let items = list_snapshot(vm, &args[0])?;
    Ok(items.choose(&mut rand::thread_rng()).cloned().unwrap_or(Value::Nil))
}

fn list_join(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let separator = str_arg(args, 1, "join")?;
    let items = list_snapshot(vm, &args[0])?;
    let parts: Vec<String> = items.iter().map(|item| vm.stringify(item)).collect();
    Ok(make_str_value(&parts.join(&separator)))
}

fn extreme_by(vm: &mut VM, args: &[Value], wanted: Ordering) -> Result<Value, String> {
    let callback = arg(args, 1);
    let mut best: Option<(f64, Value)> = None;
    for item in list_snapshot(vm, &args[0])? {
        let key = vm.call_function(callback.clone(), &[item.clone()])?;
        let key = key.as_float().ok_or("minBy/maxBy selector must return a number.")?;
        let replace = match &best {
            None => true,
            Some((current, _)) => key.partial_cmp(current) == Some(wanted),
        };
        if replace {
            best = Some((key, item));
        }
    }
    Ok(best.map_or(Value::Nil, |(_, item)| item))
}

fn list_min_by(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    extreme_by(vm, args, Ordering::Less)
}

fn list_max_by(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    extreme_by(vm, args, Ordering::Greater)
}

fn range_init(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let (min, max) = match (arg(args, 1), arg(args, 2)) {
        (Value::Int(min), Value::Int(max)) => (min, max),
        _ => return Err("Range limits must be integers!".to_string()),
    };
    if let Value::Instance(id) = &args[0] {
        let fields = &mut vm.heap_mut().instance_mut(*id).fields;
        fields.insert(Rc::from(FIELD_MIN), Value::Int(min));
        fields.insert(Rc::from(FIELD_MAX), Value::Int(max));
    }
    Ok(args[0].clone())
}

fn range_limits(vm: &VM, range: &Value) -> Result<(i64, i64), String> {
    match (vm.instance_field(range, FIELD_MIN), vm.instance_field(range, FIELD_MAX)) {
        (Some(Value::Int(min)), Some(Value::Int(max))) => Ok((min, max)),
        _ => Err("Range limits must be integers!".to_string()),
    }
}

fn range_has(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let (min, max) = range_limits(vm, &args[0])?;
    Ok(Value::Bool(match arg(args, 1).as_float() {
        Some(value) => min as f64 <= value && value <= max as f64,
        None => false,
    }))
}

fn range_iterate(vm: &mut VM, args: &[Value]) -> Result<Value, String> {
    let (min, max) = range_limits(vm, &args[0])?;
    Ok(iterator(vm, RangeIterator { current: Cell::new(Some(min)), max }))
}

#[cfg(test)]
mod tests {
    use crate::vm::VM;

    fn eval_string(source: &str) -> String {
        let mut vm = VM::new();
        let value = vm.interpret_source("test", source).unwrap();
        vm.stringify(&value)
    }

    #[test]
    fn test_int_times_and_limits() {
        assert_eq!(eval_string("n = 3\ntotal = 0\nfor i in n.times {\n  total += i\n}\ntotal"), "3");
        assert_eq!(eval_string("Int.max"), i64::MAX.to_string());
    }

    #[test]
    fn test_times_on_non_positive_counts_is_empty() {
        assert_eq!(eval_string("n = 0
total = 0
for i in n.times {
  total += 1
}
total"), "0");
        assert_eq!(eval_string("n = Int.min
total = 0
for i in n.times {
  total += 1
}
total"), "0");
    }

    #[test]
    fn test_range_ending_at_int_max_terminates() {
        let source = "hi = Int.max
lo = hi - 1
total = 0
for i in lo...hi {
  total += 1
}
total";
        assert_eq!(eval_string(source), "2");
        let source = "hi = Int.max
it = Range(hi, hi).iterate()
[it.next(), it.next(), it.next()]";
        assert_eq!(eval_string(source), format!("[{}, null, null]", i64::MAX));
    }

    #[test]
    fn test_str_natives() {
        assert_eq!(eval_string("\"Hello\".length"), "5");
        assert_eq!(eval_string("\"ell\" in \"Hello\""), "true");
        assert_eq!(eval_string("\"{1}-{0}\".format([1, \"b\"])"), "b-1");
        assert_eq!(eval_string("\"Ab\".uppercased + \"Ab\".lowercased"), "ABab");
        assert_eq!(eval_string("[\"abc\".startsWith(\"ab\"), \"abc\".endsWith(\"x\"), \"\".isEmpty]"), "[true, false, true]");
    }

    #[test]
    fn test_str_iterates_chars() {
        assert_eq!(eval_string("out = []\nfor c in \"abc\" {\n  out.add(c)\n}\nout"), "[\"a\", \"b\", \"c\"]");
    }

    #[test]
    fn test_object_keys() {
        assert_eq!(eval_string("[b: 1, a: 2].keys"), "[\"b\", \"a\"]");
    }

    #[test]
    fn test_list_mutation() {
        let source = "xs = [1, 2]\nxs.addAll([3, 4])\nxs.insert(0, 0)\nxs.removeAt(4)\nxs";
        assert_eq!(eval_string(source), "[0, 1, 2, 3]");
        assert_eq!(eval_string("xs = [1]\nxs.clear()\n[xs.size, xs.isEmpty]"), "[0, true]");
    }

    #[test]
    fn test_list_queries() {
        assert_eq!(eval_string("[1, 2, 1].indexOf(1)"), "0");
        assert_eq!(eval_string("[1, 2, 1].lastIndexOf(1)"), "2");
        assert_eq!(eval_string("[1, 2].indexOf(5)"), "null");
        assert_eq!(eval_string("[1, 2, 3, 4].sublist(1, 2)"), "[2, 3]");
        assert_eq!(eval_string("[1, 2, 3].take(5)"), "[1, 2, 3]");
        assert_eq!(eval_string("[1, 2, 3].count(fn (x) => x > 1)"), "2");
        assert_eq!(eval_string("[[1, 2].any(fn (x) => x > 1), [1, 2].all(fn (x) => x > 1)]"), "[true, false]");
        assert_eq!(eval_string("[[1, 2, 3].first(fn (x) => x > 1), [1, 2, 3].last(), [].first()]"), "[2, 3, null]");
    }

    #[test]
    fn test_list_transforms() {
        assert_eq!(eval_string("[1, 2].map(fn (x) => x * 10)"), "[10, 20]");
        assert_eq!(eval_string("[1, null, 2].compactMap"), "[1, 2]");
        assert_eq!(eval_string("[1, 2, 3].reduce(0, fn (acc, x) => acc + x)"), "6");
        assert_eq!(eval_string("[1, 2, 3].mapToObject(fn (x) => \"k$(x)\", fn (x) => x * x)"), "[k1: 1, k2: 4, k3: 9]");
        assert_eq!(eval_string("[1, 2, 3, 4].groupBy(fn (x) => x % 2)"), "[1: [1, 3], 0: [2, 4]]");
        assert_eq!(eval_string("[3, 1, 2].sortedBy(fn (a, b) => a - b)"), "[1, 2, 3]");
        assert_eq!(eval_string("[1, 2, 3].reversed"), "[3, 2, 1]");
        assert_eq!(eval_string("[1, 2, 1, 3].unique"), "[1, 2, 3]");
        assert_eq!(eval_string("[1, 2, 3].join(\", \")"), "1, 2, 3");
        assert_eq!(eval_string("[\"aa\", \"b\"].minBy(fn (s) => s.length)"), "b");
        assert_eq!(eval_string("[\"aa\", \"b\"].maxBy(fn (s) => s.length)"), "aa");
        assert_eq!(eval_string("[1, 2, 3].shuffled.size"), "3");
        assert_eq!(eval_string("[].randomItem"), "null");
    }

    #[test]
    fn test_range_natives() {
        assert_eq!(eval_string("r = Range(2, 4)\n[r.min, r.max, 3 in r, 5 in r]"), "[2, 4, true, false]");
        assert_eq!(eval_string("out = []\nfor i in Range(1, 3) {\n  out.add(i)\n}\nout"), "[1, 2, 3]");
    }
}
