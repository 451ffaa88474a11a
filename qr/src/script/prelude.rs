//! Embedded Lua prelude
//!
//! Runs once per engine after the Rust-side `quest` bindings are in
//! place. Defines the pure-Lua parts of the script API: the `expect`
//! matcher set, `quest.skip`, and the console/print wiring on top of the
//! native capture hook.

/// Sentinel raised by `quest.skip()` and recognized by `quest.test`
pub const SKIP_MARKER: &str = "__quest_skip__";

/// The prelude source
pub const PRELUDE: &str = r##"
-- quest.expect: a small familiar matcher set
quest.expect = function(actual)
    local matcher = {}

    local function fail(message)
        error(message, 0)
    end

    function matcher.to_equal(expected)
        if actual ~= expected then
            fail(string.format("expected %s to equal %s", tostring(actual), tostring(expected)))
        end
    end

    function matcher.to_not_equal(expected)
        if actual == expected then
            fail(string.format("expected %s to differ from %s", tostring(actual), tostring(expected)))
        end
    end

    function matcher.to_be_true()
        if actual ~= true then
            fail(string.format("expected %s to be true", tostring(actual)))
        end
    end

    function matcher.to_be_nil()
        if actual ~= nil then
            fail(string.format("expected %s to be nil", tostring(actual)))
        end
    end

    function matcher.to_contain(needle)
        if type(actual) == "string" then
            if not string.find(actual, needle, 1, true) then
                fail(string.format("expected %q to contain %q", actual, tostring(needle)))
            end
            return
        end
        if type(actual) == "table" then
            for _, v in pairs(actual) do
                if v == needle then return end
            end
            fail(string.format("expected table to contain %s", tostring(needle)))
        end
        fail(string.format("cannot check containment on a %s", type(actual)))
    end

    function matcher.to_be_above(threshold)
        if not (type(actual) == "number" and actual > threshold) then
            fail(string.format("expected %s to be above %s", tostring(actual), tostring(threshold)))
        end
    end

    function matcher.to_be_below(threshold)
        if not (type(actual) == "number" and actual < threshold) then
            fail(string.format("expected %s to be below %s", tostring(actual), tostring(threshold)))
        end
    end

    return matcher
end

-- quest.skip(): abandon the enclosing quest.test body as "skipped"
quest.skip = function()
    error("__quest_skip__", 0)
end

-- console capture: every level funnels into the native hook
local function stringify(...)
    local parts = {}
    for i = 1, select("#", ...) do
        parts[#parts + 1] = tostring(select(i, ...))
    end
    return table.concat(parts, " ")
end

console = {
    log = function(...) __quest_console("log", stringify(...)) end,
    info = function(...) __quest_console("info", stringify(...)) end,
    warn = function(...) __quest_console("warn", stringify(...)) end,
    error = function(...) __quest_console("error", stringify(...)) end,
}

print = console.log
"##;
